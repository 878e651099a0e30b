//! Bulk loader: truncate-and-copy from a staged CSV
//!
//! One load runs under the table's barrier in a single database transaction:
//! truncate, then `COPY` the staged rows in fixed-size units, each unit on its
//! own savepoint. A unit the database refuses is rolled back and its rows are
//! retried one at a time, so a single bad row costs one row, not the whole
//! unit. The `LOAD_STARTED` entry written before the transaction opens is the
//! in-flight marker; a load that dies leaves it without a matching
//! `LOAD_COMPLETED` and the table untouched.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::barrier::LoadBarrier;
use crate::codec::csv::decode_staged_csv;
use crate::db::{Repository, TableWriter};
use crate::error::{EngineResult, ErrorKind};
use crate::migration_log::{LogReference, MigrationLog, MigrationLogEntry};
use crate::schema::{Row, Table};
use crate::storage::{StagingError, StagingStore};

/// Rows per `COPY` unit
pub const DEFAULT_LOAD_UNIT_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Truncate first; the historical path
    Replace,
    /// Keep existing rows; the online path
    Append,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => f.write_str("replace"),
            Self::Append => f.write_str("append"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub table: Table,
    pub mode: LoadMode,
    pub staged_path: String,
    pub rows_loaded: u64,
    pub rows_rejected: u64,
    pub units: usize,
    /// Units that fell back to row-by-row inserts
    pub units_degraded: usize,
    pub next_identity: Option<i64>,
    pub duration: Duration,
    pub log_reference: LogReference,
}

#[derive(Clone)]
pub struct BulkLoader {
    repository: Arc<dyn Repository>,
    staging: Arc<dyn StagingStore>,
    log: MigrationLog,
    barrier: LoadBarrier,
    unit_size: usize,
}

impl BulkLoader {
    pub fn new(
        repository: Arc<dyn Repository>,
        staging: Arc<dyn StagingStore>,
        log: MigrationLog,
        barrier: LoadBarrier,
    ) -> Self {
        Self {
            repository,
            staging,
            log,
            barrier,
            unit_size: DEFAULT_LOAD_UNIT_SIZE,
        }
    }

    pub fn with_unit_size(mut self, unit_size: usize) -> Self {
        self.unit_size = unit_size.max(1);
        self
    }

    /// Replace the contents of `table` with the staged rows
    pub async fn load(&self, table: Table, staged_path: &str) -> EngineResult<LoadReport> {
        self.run(table, staged_path, LoadMode::Replace).await
    }

    /// Add the staged rows to `table` without truncating
    pub async fn append(&self, table: Table, staged_path: &str) -> EngineResult<LoadReport> {
        self.run(table, staged_path, LoadMode::Append).await
    }

    #[instrument(skip(self), fields(table = %table, mode = %mode))]
    async fn run(&self, table: Table, staged_path: &str, mode: LoadMode) -> EngineResult<LoadReport> {
        let timer = Instant::now();
        let reference = LogReference::new(table, Utc::now());
        let _barrier = self.barrier.acquire(table).await;

        self.log
            .record(
                MigrationLogEntry::new(
                    table,
                    ErrorKind::LoadStarted,
                    format!("{} load from {} started", mode, self.staging.uri(staged_path)),
                )
                .with_raw(json!({ "staged_path": staged_path, "mode": mode })),
            )
            .await;

        let data = match self.staging.get(staged_path).await {
            Ok(data) => data,
            Err(e) => {
                let kind = match &e {
                    StagingError::NotFound { .. } => ErrorKind::StagedObjectMissing,
                    _ => ErrorKind::StagingUnavailable,
                };
                self.log
                    .record(MigrationLogEntry::new(
                        table,
                        kind,
                        format!("staged input {} unreadable: {}", staged_path, e),
                    ))
                    .await;
                return Err(e.into());
            },
        };

        let schema = table.schema();
        let mut rows: Vec<Row> = Vec::new();
        let mut unreadable = Vec::new();
        for decoded in decode_staged_csv(schema, &data)? {
            match decoded {
                Ok(row) => rows.push(row),
                Err(e) => unreadable.push(
                    MigrationLogEntry::new(
                        table,
                        ErrorKind::LoadError,
                        format!("staged line {}: {}", e.line, e.message),
                    )
                    .with_record_id(e.raw.record_id())
                    .with_raw(e.raw.to_json()),
                ),
            }
        }
        let mut rows_rejected = unreadable.len() as u64;
        self.log.record_all(unreadable).await;

        let mut writer = self.repository.writer(table).await?;
        if mode == LoadMode::Replace {
            writer.truncate().await?;
        }

        let mut rows_loaded = 0u64;
        let mut units = 0usize;
        let mut units_degraded = 0usize;

        for unit in rows.chunks(self.unit_size) {
            units += 1;
            match writer.copy_rows(unit).await {
                Ok(copied) => rows_loaded += copied,
                Err(e) if e.is_rejection() => {
                    units_degraded += 1;
                    warn!(unit = units, error = %e, "Unit rejected, inserting its rows one by one");
                    let (loaded, rejected) = self.insert_one_by_one(table, writer.as_mut(), unit).await?;
                    rows_loaded += loaded;
                    rows_rejected += rejected;
                },
                Err(e) => return Err(e.into()),
            }
        }

        let next_identity = writer.reconcile_identity().await?;
        writer.commit().await?;

        let report = LoadReport {
            table,
            mode,
            staged_path: staged_path.to_string(),
            rows_loaded,
            rows_rejected,
            units,
            units_degraded,
            next_identity,
            duration: timer.elapsed(),
            log_reference: reference,
        };

        self.log
            .record(
                MigrationLogEntry::new(
                    table,
                    ErrorKind::LoadCompleted,
                    format!(
                        "{} load completed: {} rows loaded, {} rejected in {} units ({} degraded)",
                        mode, rows_loaded, rows_rejected, units, units_degraded
                    ),
                )
                .with_raw(json!({
                    "staged_path": staged_path,
                    "rows_loaded": rows_loaded,
                    "rows_rejected": rows_rejected,
                    "units": units,
                    "units_degraded": units_degraded,
                    "duration_ms": report.duration.as_millis() as u64,
                })),
            )
            .await;

        info!(
            rows_loaded,
            rows_rejected,
            units,
            units_degraded,
            duration_ms = report.duration.as_millis() as u64,
            "Load completed"
        );

        Ok(report)
    }

    async fn insert_one_by_one(
        &self,
        table: Table,
        writer: &mut dyn TableWriter,
        unit: &[Row],
    ) -> EngineResult<(u64, u64)> {
        let schema = table.schema();
        let mut loaded = 0;
        let mut entries = Vec::new();

        for row in unit {
            match writer.insert_row(row).await {
                Ok(()) => loaded += 1,
                Err(e) if e.is_rejection() => {
                    let record = row.to_record(schema);
                    entries.push(
                        MigrationLogEntry::new(table, ErrorKind::LoadError, e.to_string())
                            .with_record_id(record.record_id())
                            .with_raw(record.to_json()),
                    );
                },
                Err(e) => return Err(e.into()),
            }
        }

        let rejected = entries.len() as u64;
        self.log.record_all(entries).await;
        Ok((loaded, rejected))
    }
}
