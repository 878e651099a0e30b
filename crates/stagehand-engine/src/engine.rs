//! Engine facade
//!
//! [`MigrationEngine`] wires validator, staging store, loader, backup writer,
//! restore reader and migration log together and exposes the operations the
//! surrounding service triggers: online batches, historical migrations,
//! backups and restores.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backup::{BackupManifest, BackupReport, BackupWriter};
use crate::barrier::LoadBarrier;
use crate::codec::csv::encode_staged_csv;
use crate::config::EngineConfig;
use crate::db::{self, PgRepository, Repository};
use crate::error::{EngineResult, ErrorKind};
use crate::loader::{BulkLoader, LoadReport};
use crate::migration_log::{LogReference, LogSink, MigrationLog, MigrationLogEntry, PgLogSink};
use crate::paths;
use crate::restore::{RestoreReader, RestoreReport};
use crate::schema::{Batch, Record, Row, Table, MAX_BATCH_SIZE};
use crate::source::CsvBatchSource;
use crate::storage::{S3Staging, StagingStore};
use crate::validator::{partition, Validator};

/// One rejected record of an online batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub table: Table,
    pub success_count: u64,
    /// Validation rejections plus rows the database refused
    pub error_count: u64,
    /// Validation rejections by position in the batch
    pub errors: Vec<BatchError>,
    /// Raw stage of the accepted rows; `None` when nothing was accepted
    pub staged_path: Option<String>,
    pub log_reference: LogReference,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub table: Table,
    pub source: PathBuf,
    pub records_read: u64,
    pub records_rejected: u64,
    pub batches: usize,
    pub load: LoadReport,
    pub duration: Duration,
    pub log_reference: LogReference,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TableOutcome {
    Migrated(MigrationReport),
    /// No `{table}.csv` in the data directory
    Skipped { table: Table, path: PathBuf },
}

impl TableOutcome {
    pub fn table(&self) -> Table {
        match self {
            Self::Migrated(report) => report.table,
            Self::Skipped { table, .. } => *table,
        }
    }
}

pub struct MigrationEngine {
    config: EngineConfig,
    staging: Arc<dyn StagingStore>,
    log: MigrationLog,
    validator: Validator,
    loader: BulkLoader,
    backup: BackupWriter,
    restore: RestoreReader,
}

impl MigrationEngine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        staging: Arc<dyn StagingStore>,
        log_sink: Arc<dyn LogSink>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let migration = &config.migration;
        let log = MigrationLog::new(log_sink, migration.log_timeout());
        let barrier = LoadBarrier::new();

        let validator = Validator::new(Arc::clone(&repository), log.clone())?;
        let loader = BulkLoader::new(
            Arc::clone(&repository),
            Arc::clone(&staging),
            log.clone(),
            barrier.clone(),
        )
        .with_unit_size(migration.load_unit_size);
        let backup = BackupWriter::new(
            Arc::clone(&repository),
            Arc::clone(&staging),
            log.clone(),
            barrier.clone(),
        )
        .with_chunk_size(migration.chunk_size)
        .with_pipeline_depth(migration.pipeline_depth);
        let restore = RestoreReader::new(repository, Arc::clone(&staging), log.clone(), barrier)
            .with_pipeline_depth(migration.pipeline_depth)
            .with_retries(migration.restore_chunk_retries);

        Ok(Self {
            config,
            staging,
            log,
            validator,
            loader,
            backup,
            restore,
        })
    }

    /// Connect to PostgreSQL and S3, apply migrations and build the engine
    pub async fn connect(config: EngineConfig) -> EngineResult<Self> {
        let pool = db::create_pool(&config.database).await?;
        db::health_check(&pool).await?;
        db::run_migrations(&pool).await?;

        let staging = S3Staging::new(config.storage.clone()).await;
        staging.ensure_bucket().await?;

        Self::new(
            config,
            Arc::new(PgRepository::new(pool.clone())),
            Arc::new(staging),
            Arc::new(PgLogSink::new(pool)),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &MigrationLog {
        &self.log
    }

    /// Online path: validate a batch, stage the accepted rows and append
    /// them to the table. Rejected records never block accepted ones.
    #[instrument(skip(self, records), fields(table = %table, records = records.len()))]
    pub async fn submit_batch(&self, table: Table, records: Vec<Record>) -> EngineResult<BatchReport> {
        let reference = LogReference::new(table, Utc::now());
        let batch = Batch::new(records)?;

        let results = self.validator.validate(table, &batch).await?;
        let (rows, rejections) = partition(results);
        let errors: Vec<BatchError> = rejections
            .into_iter()
            .map(|r| BatchError {
                index: r.index,
                kind: r.kind,
                message: r.message,
            })
            .collect();

        let mut success_count = 0;
        let mut error_count = errors.len() as u64;
        let mut staged_path = None;

        if !rows.is_empty() {
            let path = self.stage_rows(table, &rows).await?;
            let load = self.loader.append(table, &path).await?;
            success_count = load.rows_loaded;
            error_count += load.rows_rejected;
            staged_path = Some(path);
        }

        info!(success_count, error_count, "Batch processed");

        Ok(BatchReport {
            table,
            success_count,
            error_count,
            errors,
            staged_path,
            log_reference: reference,
        })
    }

    /// Historical path: validate a CSV file in batches of 1000, stage the
    /// accepted rows as one raw CSV and replace the table with them
    #[instrument(skip(self, csv_path), fields(table = %table, path = %csv_path.as_ref().display()))]
    pub async fn migrate_table(
        &self,
        table: Table,
        csv_path: impl AsRef<Path>,
    ) -> EngineResult<MigrationReport> {
        let timer = Instant::now();
        let reference = LogReference::new(table, Utc::now());
        let source = CsvBatchSource::from_path(table, csv_path.as_ref()).await?;

        let mut run = self.validator.begin_run(table, false).await?;
        let mut accepted = Vec::new();
        let mut records_read = 0u64;
        let mut records_rejected = 0u64;

        for batch in source.batches(MAX_BATCH_SIZE)? {
            let batch = batch?;
            records_read += batch.len() as u64;
            let results = self.validator.validate_batch(&mut run, &batch).await?;
            let (rows, rejections) = partition(results);
            records_rejected += rejections.len() as u64;
            accepted.extend(rows);
        }

        let staged_path = self.stage_rows(table, &accepted).await?;
        let load = self.loader.load(table, &staged_path).await?;

        let report = MigrationReport {
            table,
            source: csv_path.as_ref().to_path_buf(),
            records_read,
            records_rejected,
            batches: run.batches(),
            load,
            duration: timer.elapsed(),
            log_reference: reference,
        };
        info!(
            records_read,
            records_rejected,
            rows_loaded = report.load.rows_loaded,
            "Table migrated"
        );
        Ok(report)
    }

    /// Migrate every table from `{data_dir}/{table}.csv` in dependency order.
    /// Uses the configured data directory when `data_dir` is `None`.
    pub async fn migrate_all(&self, data_dir: Option<&Path>) -> EngineResult<Vec<TableOutcome>> {
        let data_dir = data_dir.unwrap_or(self.config.migration.data_dir.as_path());
        let mut outcomes = Vec::with_capacity(Table::ALL.len());

        for table in Table::ALL {
            let path = data_dir.join(format!("{}.csv", table));
            if !tokio::fs::try_exists(&path).await? {
                warn!(%table, path = %path.display(), "No CSV for table, skipping");
                outcomes.push(TableOutcome::Skipped { table, path });
                continue;
            }
            outcomes.push(TableOutcome::Migrated(self.migrate_table(table, &path).await?));
        }
        Ok(outcomes)
    }

    pub async fn backup(&self, table: Table) -> EngineResult<BackupReport> {
        self.backup.backup(table).await
    }

    pub async fn backup_with_cancel(
        &self,
        table: Table,
        cancel: &CancellationToken,
    ) -> EngineResult<BackupReport> {
        self.backup.backup_with_cancel(table, cancel).await
    }

    /// Restore `table` from `backup_path`, or from its latest backup. Rows
    /// are written `chunk_size` at a time, defaulting to the configured
    /// chunk size.
    pub async fn restore(
        &self,
        table: Table,
        backup_path: Option<&str>,
        chunk_size: Option<usize>,
    ) -> EngineResult<RestoreReport> {
        self.restore_with_cancel(table, backup_path, chunk_size, &CancellationToken::new())
            .await
    }

    pub async fn restore_with_cancel(
        &self,
        table: Table,
        backup_path: Option<&str>,
        chunk_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> EngineResult<RestoreReport> {
        let chunk_size = chunk_size.unwrap_or(self.config.migration.chunk_size);
        self.restore
            .restore_with_cancel(table, backup_path, chunk_size, cancel)
            .await
    }

    /// Published backups of `table`, oldest first
    pub async fn list_backups(&self, table: Table) -> EngineResult<Vec<BackupManifest>> {
        self.backup.list_backups(table).await
    }

    /// Write `rows` as a raw CSV stage under a fresh timestamped path
    async fn stage_rows(&self, table: Table, rows: &[Row]) -> EngineResult<String> {
        let path = paths::raw_stage_path(table, paths::monotonic_now());
        let data = encode_staged_csv(table.schema(), rows)?;
        if let Err(e) = self.staging.put(&path, data.into()).await {
            self.log
                .record(MigrationLogEntry::new(
                    table,
                    ErrorKind::StagingUnavailable,
                    format!("raw stage {} not written: {}", self.staging.uri(&path), e),
                ))
                .await;
            return Err(e.into());
        }
        Ok(path)
    }
}
