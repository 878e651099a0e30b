//! Restore reader
//!
//! Replays a backup into its table under the load barrier, inside one write
//! transaction: truncate, then every chunk in manifest order. Original
//! identifiers are kept and the identity generator is moved past the largest
//! one before commit, for every chunk of every restore.
//!
//! A fetch task downloads, verifies and decodes chunks ahead of the writer
//! through a bounded channel. Transient fetch failures are retried with
//! backoff. A chunk that still cannot be fetched, or whose rows the database
//! refuses, is logged as `RESTORE_CHUNK_FAILED` and the restore moves on. A
//! chunk with only some rows refused counts as partial, not as failed.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use stagehand_common::checksum::matches_sha256;

use crate::backup::{latest_manifest, BackupManifest, ChunkEntry, DEFAULT_PIPELINE_DEPTH};
use crate::barrier::LoadBarrier;
use crate::codec::parquet::decode_parquet;
use crate::db::{Repository, TableWriter};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::migration_log::{LogReference, MigrationLog, MigrationLogEntry};
use crate::paths;
use crate::schema::{Row, Table};
use crate::storage::{StagingError, StagingStore};

/// Rows per write when the caller does not say otherwise
pub const DEFAULT_RESTORE_CHUNK_SIZE: usize = 1000;

/// Extra fetch attempts for a chunk after a transient failure
pub const DEFAULT_RESTORE_RETRIES: usize = 3;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub table: Table,
    pub backup_path: String,
    pub chunks_total: usize,
    /// Every row written
    pub chunks_restored: usize,
    /// Some rows written, the rest refused by the database
    pub chunks_partial: usize,
    /// Nothing written: fetch, checksum or decode failure, or every row refused
    pub chunks_failed: usize,
    pub rows_restored: u64,
    /// Rows of partial and failed chunks that were not written
    pub rows_failed: u64,
    pub next_identity: Option<i64>,
    /// The table was left truncated and only partially loaded
    pub cancelled: bool,
    pub duration: Duration,
    pub log_reference: LogReference,
}

struct FetchedChunk {
    index: usize,
    entry: ChunkEntry,
    rows: Result<Vec<Row>, String>,
}

#[derive(Clone)]
pub struct RestoreReader {
    repository: Arc<dyn Repository>,
    staging: Arc<dyn StagingStore>,
    log: MigrationLog,
    barrier: LoadBarrier,
    pipeline_depth: usize,
    retries: usize,
    retry_delay: Duration,
}

impl RestoreReader {
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
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            retries: DEFAULT_RESTORE_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Delay before the first retry; doubled for each further attempt
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Find the manifest to restore: the one at `backup_path`, or the newest
    /// backup of `table` when no path is given
    pub async fn resolve_manifest(
        &self,
        table: Table,
        backup_path: Option<&str>,
    ) -> EngineResult<BackupManifest> {
        let Some(backup_path) = backup_path else {
            return match latest_manifest(self.staging.as_ref(), table).await? {
                Some(manifest) => Ok(manifest),
                None => {
                    self.log
                        .record(MigrationLogEntry::new(
                            table,
                            ErrorKind::NoBackupFound,
                            format!("no backup manifest under {}", self.staging.uri(&paths::table_prefix(table))),
                        ))
                        .await;
                    Err(EngineError::NoBackupFound {
                        table: table.to_string(),
                    })
                },
            };
        };

        let path = paths::manifest_path(&paths::normalize_backup_dir(backup_path));
        let data = match self.staging.get(&path).await {
            Ok(data) => data,
            Err(StagingError::NotFound { .. }) => {
                return Err(EngineError::manifest(path, "manifest not found"));
            },
            Err(e) => return Err(e.into()),
        };
        let manifest = BackupManifest::from_json(&path, &data)?;
        if manifest.table != table {
            return Err(EngineError::manifest(
                path,
                format!("backup belongs to table '{}', not '{}'", manifest.table, table),
            ));
        }
        Ok(manifest)
    }

    pub async fn restore(
        &self,
        table: Table,
        backup_path: Option<&str>,
        chunk_size: usize,
    ) -> EngineResult<RestoreReport> {
        self.restore_with_cancel(table, backup_path, chunk_size, &CancellationToken::new())
            .await
    }

    /// Restore `table` from a backup. Once `cancel` fires the restore stops
    /// at the next chunk boundary, commits what it has written and returns a
    /// report with `cancelled` set.
    #[instrument(skip(self, cancel), fields(table = %table))]
    pub async fn restore_with_cancel(
        &self,
        table: Table,
        backup_path: Option<&str>,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> EngineResult<RestoreReport> {
        let timer = Instant::now();
        let reference = LogReference::new(table, Utc::now());
        let chunk_size = chunk_size.max(1);
        let _barrier = self.barrier.acquire(table).await;

        let manifest = self.resolve_manifest(table, backup_path).await?;
        self.log
            .record(
                MigrationLogEntry::new(
                    table,
                    ErrorKind::RestoreStarted,
                    format!(
                        "restore from {} started: {} rows in {} chunks",
                        self.staging.uri(&manifest.backup_path),
                        manifest.row_count,
                        manifest.chunk_count
                    ),
                )
                .with_raw(json!({
                    "backup_path": manifest.backup_path,
                    "row_count": manifest.row_count,
                    "chunk_count": manifest.chunk_count,
                    "chunk_size": chunk_size,
                })),
            )
            .await;

        let mut writer = self.repository.writer(table).await?;
        writer.truncate().await?;

        let (tx, mut rx) = mpsc::channel(self.pipeline_depth);
        let fetcher = tokio::spawn(fetch_chunks(
            Arc::clone(&self.staging),
            manifest.clone(),
            self.retries,
            self.retry_delay,
            cancel.clone(),
            tx,
        ));

        let mut processed = 0usize;
        let mut chunks_restored = 0usize;
        let mut chunks_partial = 0usize;
        let mut chunks_failed = 0usize;
        let mut rows_restored = 0u64;
        let mut rows_failed = 0u64;

        while let Some(fetched) = rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            processed += 1;

            let failure = match fetched.rows {
                Ok(rows) => {
                    let (written, rejected) = write_chunk(writer.as_mut(), &rows, chunk_size).await?;
                    rows_restored += written;
                    if rejected == 0 {
                        chunks_restored += 1;
                        debug!(chunk = fetched.index, rows = written, "Chunk restored");
                        continue;
                    }
                    rows_failed += rejected;
                    if written > 0 {
                        chunks_partial += 1;
                    } else {
                        chunks_failed += 1;
                    }
                    format!("{} of {} rows rejected by the database", rejected, rows.len())
                },
                Err(reason) => {
                    rows_failed += fetched.entry.rows;
                    chunks_failed += 1;
                    reason
                },
            };

            self.log
                .record(
                    MigrationLogEntry::new(
                        table,
                        ErrorKind::RestoreChunkFailed,
                        format!("chunk {} ({}): {}", fetched.index, fetched.entry.file, failure),
                    )
                    .with_raw(json!({
                        "backup_path": manifest.backup_path,
                        "file": fetched.entry.file,
                        "rows": fetched.entry.rows,
                    })),
                )
                .await;
        }
        drop(rx);
        fetcher.await?;

        let cancelled = processed < manifest.chunk_count && cancel.is_cancelled();
        let next_identity = writer.reconcile_identity().await?;
        writer.commit().await?;

        let report = RestoreReport {
            table,
            backup_path: manifest.backup_path.clone(),
            chunks_total: manifest.chunk_count,
            chunks_restored,
            chunks_partial,
            chunks_failed,
            rows_restored,
            rows_failed,
            next_identity,
            cancelled,
            duration: timer.elapsed(),
            log_reference: reference,
        };

        let (kind, outcome) = if cancelled {
            (ErrorKind::RestoreCancelled, "cancelled; table is partially loaded")
        } else {
            (ErrorKind::RestoreCompleted, "completed")
        };
        self.log
            .record(
                MigrationLogEntry::new(
                    table,
                    kind,
                    format!(
                        "restore from {} {}: {} rows restored, {} rows failed, {} of {} chunks partial, {} failed",
                        manifest.backup_path,
                        outcome,
                        rows_restored,
                        rows_failed,
                        chunks_partial,
                        manifest.chunk_count,
                        chunks_failed
                    ),
                )
                .with_raw(serde_json::to_value(&report)?),
            )
            .await;

        if cancelled {
            warn!(
                chunks_processed = processed,
                chunks_total = manifest.chunk_count,
                rows_restored,
                "Restore cancelled"
            );
        } else {
            info!(
                rows_restored,
                rows_failed,
                chunks_partial,
                chunks_failed,
                next_identity = ?next_identity,
                duration_ms = report.duration.as_millis() as u64,
                "Restore completed"
            );
        }

        Ok(report)
    }
}

/// Write one chunk in sub-batches. Returns rows written and rows refused.
/// A refused sub-batch is retried row by row; anything other than a refusal
/// aborts the restore, since the transaction is gone with it.
async fn write_chunk(
    writer: &mut dyn TableWriter,
    rows: &[Row],
    chunk_size: usize,
) -> EngineResult<(u64, u64)> {
    let mut written = 0;
    let mut rejected = 0;
    for batch in rows.chunks(chunk_size) {
        match writer.copy_rows(batch).await {
            Ok(copied) => written += copied,
            Err(e) if e.is_rejection() => {
                warn!(error = %e, rows = batch.len(), "Restore batch rejected, writing rows one by one");
                for row in batch {
                    match writer.insert_row(row).await {
                        Ok(()) => written += 1,
                        Err(e) if e.is_rejection() => rejected += 1,
                        Err(e) => return Err(e.into()),
                    }
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok((written, rejected))
}

async fn fetch_chunks(
    staging: Arc<dyn StagingStore>,
    manifest: BackupManifest,
    retries: usize,
    retry_delay: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<FetchedChunk>,
) {
    let schema = manifest.table.schema();
    for (index, entry) in manifest.chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            return;
        }
        let path = manifest.chunk_path(entry);
        let rows = fetch_chunk(staging.as_ref(), &path, entry, retries, retry_delay)
            .await
            .and_then(|data| {
                let rows = decode_parquet(schema, data).map_err(|e| e.to_string())?;
                if rows.len() as u64 != entry.rows {
                    return Err(format!(
                        "expected {} rows, decoded {}",
                        entry.rows,
                        rows.len()
                    ));
                }
                Ok(rows)
            });

        let fetched = FetchedChunk {
            index,
            entry: entry.clone(),
            rows,
        };
        if tx.send(fetched).await.is_err() {
            return;
        }
    }
}

/// Download and verify one chunk, retrying transient failures
async fn fetch_chunk(
    staging: &dyn StagingStore,
    path: &str,
    entry: &ChunkEntry,
    retries: usize,
    retry_delay: Duration,
) -> Result<bytes::Bytes, String> {
    let mut attempt = 0;
    loop {
        match staging.get(path).await {
            Ok(data) => {
                if !entry.sha256.is_empty() && !matches_sha256(&data, &entry.sha256) {
                    return Err(format!("checksum mismatch for {}", path));
                }
                return Ok(data);
            },
            Err(e @ StagingError::NotFound { .. }) => return Err(e.to_string()),
            Err(e) if attempt < retries => {
                attempt += 1;
                let delay = retry_delay * 2u32.saturating_pow(attempt as u32 - 1);
                warn!(path, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Chunk fetch failed, retrying");
                tokio::time::sleep(delay).await;
            },
            Err(e) => return Err(format!("{} (after {} attempts)", e, attempt + 1)),
        }
    }
}
