//! Backup writer
//!
//! A backup is a directory `{table}/{ts}/` of Snappy-compressed Parquet chunks
//! followed by a `manifest.json`. The manifest is written last, so a backup
//! without one never happened as far as restore is concerned. Existing
//! backups are never touched.
//!
//! Rows are read in identifier order, one chunk at a time, all from one
//! snapshot of the table so the backup is a point-in-time image even while
//! other processes write to it. Encoded chunks go
//! through a bounded channel to an upload task, which keeps reading and
//! encoding of the next chunk running while the previous one uploads and caps
//! memory at `pipeline_depth + 1` encoded chunks.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use stagehand_common::checksum::sha256_hex;

use crate::barrier::LoadBarrier;
use crate::codec::parquet::{encode_parquet, COMPRESSION_TAG, FORMAT_TAG};
use crate::db::Repository;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::migration_log::{LogReference, MigrationLog, MigrationLogEntry};
use crate::paths;
use crate::schema::{Row, Table};
use crate::storage::{StagingError, StagingStore};

/// Rows per backup chunk
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Encoded chunks allowed to wait for upload
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// File name relative to the backup directory
    pub file: String,
    pub rows: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub table: Table,
    /// Backup directory, with trailing slash
    pub backup_path: String,
    pub created_at: DateTime<Utc>,
    pub row_count: u64,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkEntry>,
    pub max_id: Option<i32>,
    pub format: String,
    pub compression: String,
}

impl BackupManifest {
    pub fn manifest_path(&self) -> String {
        paths::manifest_path(&self.backup_path)
    }

    pub fn chunk_path(&self, chunk: &ChunkEntry) -> String {
        format!("{}{}", self.backup_path, chunk.file)
    }

    pub fn to_json(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and sanity-check a manifest read from `path`
    pub fn from_json(path: &str, data: &[u8]) -> EngineResult<Self> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| EngineError::manifest(path, format!("unparseable: {}", e)))?;

        if manifest.chunk_count != manifest.chunks.len() {
            return Err(EngineError::manifest(
                path,
                format!(
                    "chunk_count {} does not match {} listed chunks",
                    manifest.chunk_count,
                    manifest.chunks.len()
                ),
            ));
        }
        let listed: u64 = manifest.chunks.iter().map(|c| c.rows).sum();
        if listed != manifest.row_count {
            return Err(EngineError::manifest(
                path,
                format!("row_count {} does not match {} listed rows", manifest.row_count, listed),
            ));
        }
        if manifest.format != FORMAT_TAG {
            return Err(EngineError::manifest(
                path,
                format!("unsupported format '{}'", manifest.format),
            ));
        }
        Ok(manifest)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub manifest: BackupManifest,
    pub duration: Duration,
    pub log_reference: LogReference,
}

struct EncodedChunk {
    path: String,
    data: Bytes,
    entry: ChunkEntry,
}

#[derive(Clone)]
pub struct BackupWriter {
    repository: Arc<dyn Repository>,
    staging: Arc<dyn StagingStore>,
    log: MigrationLog,
    barrier: LoadBarrier,
    chunk_size: usize,
    pipeline_depth: usize,
}

impl BackupWriter {
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
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub async fn backup(&self, table: Table) -> EngineResult<BackupReport> {
        self.backup_with_cancel(table, &CancellationToken::new()).await
    }

    /// Back up `table`, stopping at the next chunk boundary once `cancel`
    /// fires. A cancelled backup publishes no manifest and returns
    /// [`EngineError::Cancelled`].
    #[instrument(skip(self, cancel), fields(table = %table, chunk_size = self.chunk_size))]
    pub async fn backup_with_cancel(
        &self,
        table: Table,
        cancel: &CancellationToken,
    ) -> EngineResult<BackupReport> {
        let timer = Instant::now();
        let reference = LogReference::new(table, Utc::now());
        let _barrier = self.barrier.acquire(table).await;

        let created_at = paths::monotonic_now();
        let backup_path = paths::backup_dir(table, created_at);
        let schema = table.schema();
        info!(backup_path = %self.staging.uri(&backup_path), "Backup started");

        let mut snapshot = self.repository.snapshot(table).await?;
        let (tx, rx) = mpsc::channel::<EncodedChunk>(self.pipeline_depth);
        let uploader = tokio::spawn(upload_chunks(Arc::clone(&self.staging), rx));

        let mut after_id = None;
        let mut index = 0usize;
        let mut row_count = 0u64;
        let mut max_id: Option<i32> = None;
        let mut cancelled = false;

        let produced = async {
            loop {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }

                let rows: Vec<Row> = snapshot.read_chunk(after_id, self.chunk_size).await?;
                if rows.is_empty() {
                    break;
                }
                let full = rows.len() == self.chunk_size;
                after_id = rows.iter().filter_map(Row::id).max().or(after_id);
                max_id = max_id.max(after_id);

                let data = encode_parquet(schema, &rows)?;
                let entry = ChunkEntry {
                    file: paths::chunk_file(index),
                    rows: rows.len() as u64,
                    sha256: sha256_hex(&data),
                };
                debug!(chunk = index, rows = rows.len(), bytes = data.len(), "Chunk encoded");

                let chunk = EncodedChunk {
                    path: paths::chunk_path(&backup_path, index),
                    data: Bytes::from(data),
                    entry,
                };
                row_count += chunk.entry.rows;
                index += 1;

                // A closed channel means the uploader gave up; its error is
                // reported below.
                if tx.send(chunk).await.is_err() {
                    break;
                }
                if !full {
                    break;
                }
            }
            Ok::<(), EngineError>(())
        }
        .await;

        drop(tx);
        let uploaded = uploader.await?;
        produced?;
        let chunks = uploaded?;

        if cancelled {
            warn!(
                chunks_uploaded = chunks.len(),
                "Backup cancelled; no manifest published"
            );
            return Err(EngineError::Cancelled(format!(
                "backup of {} cancelled after {} chunks; {} has no manifest",
                table,
                chunks.len(),
                backup_path
            )));
        }

        let manifest = BackupManifest {
            table,
            backup_path: backup_path.clone(),
            created_at,
            row_count,
            chunk_count: chunks.len(),
            chunks,
            max_id,
            format: FORMAT_TAG.to_string(),
            compression: COMPRESSION_TAG.to_string(),
        };
        self.staging
            .put(&manifest.manifest_path(), Bytes::from(manifest.to_json()?))
            .await?;

        let duration = timer.elapsed();
        self.log
            .record(
                MigrationLogEntry::new(
                    table,
                    ErrorKind::BackupCompleted,
                    format!(
                        "backup {} written: {} rows in {} chunks",
                        self.staging.uri(&backup_path),
                        row_count,
                        manifest.chunk_count
                    ),
                )
                .with_raw(json!({
                    "backup_path": backup_path,
                    "row_count": row_count,
                    "chunk_count": manifest.chunk_count,
                    "max_id": max_id,
                    "duration_ms": duration.as_millis() as u64,
                })),
            )
            .await;

        info!(
            row_count,
            chunk_count = manifest.chunk_count,
            duration_ms = duration.as_millis() as u64,
            "Backup completed"
        );

        Ok(BackupReport {
            manifest,
            duration,
            log_reference: reference,
        })
    }

    /// Every published backup of `table`, oldest first
    pub async fn list_backups(&self, table: Table) -> EngineResult<Vec<BackupManifest>> {
        list_manifests(self.staging.as_ref(), table).await
    }
}

async fn upload_chunks(
    staging: Arc<dyn StagingStore>,
    mut rx: mpsc::Receiver<EncodedChunk>,
) -> Result<Vec<ChunkEntry>, StagingError> {
    let mut entries = Vec::new();
    while let Some(chunk) = rx.recv().await {
        staging.put(&chunk.path, chunk.data).await?;
        debug!(path = %chunk.path, "Chunk uploaded");
        entries.push(chunk.entry);
    }
    Ok(entries)
}

/// Manifest paths of `table` in creation order. Timestamp keys sort
/// lexicographically, so listing order is creation order.
async fn manifest_paths(staging: &dyn StagingStore, table: Table) -> EngineResult<Vec<String>> {
    let mut found: Vec<String> = staging
        .list(&paths::table_prefix(table))
        .await?
        .into_iter()
        .filter(|path| paths::is_backup_manifest(table, path))
        .collect();
    found.sort();
    Ok(found)
}

/// Readable manifests of `table` in creation order. A manifest that cannot
/// be parsed is skipped with a warning.
pub(crate) async fn list_manifests(
    staging: &dyn StagingStore,
    table: Table,
) -> EngineResult<Vec<BackupManifest>> {
    let mut manifests = Vec::new();
    for path in manifest_paths(staging, table).await? {
        let data = staging.get(&path).await?;
        match BackupManifest::from_json(&path, &data) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(path = %path, error = %e, "Skipping unreadable backup manifest"),
        }
    }
    Ok(manifests)
}

/// The newest backup of `table`, chosen by path alone. Only that manifest is
/// read, so a damaged older backup does not get in the way.
pub(crate) async fn latest_manifest(
    staging: &dyn StagingStore,
    table: Table,
) -> EngineResult<Option<BackupManifest>> {
    let Some(path) = manifest_paths(staging, table).await?.pop() else {
        return Ok(None);
    };
    let data = staging.get(&path).await?;
    BackupManifest::from_json(&path, &data).map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::parquet::decode_parquet;
    use crate::db::MemoryRepository;
    use crate::migration_log::MemoryLogSink;
    use crate::schema::Value;
    use crate::storage::MemoryStaging;

    struct Fixture {
        writer: BackupWriter,
        repo: MemoryRepository,
        staging: Arc<MemoryStaging>,
        sink: Arc<MemoryLogSink>,
    }

    fn fixture(chunk_size: usize) -> Fixture {
        let repo = MemoryRepository::new();
        let staging = Arc::new(MemoryStaging::new());
        let sink = Arc::new(MemoryLogSink::new());
        let log = MigrationLog::new(sink.clone(), Duration::from_secs(1));
        let writer = BackupWriter::new(
            Arc::new(repo.clone()),
            staging.clone(),
            log,
            LoadBarrier::new(),
        )
        .with_chunk_size(chunk_size);
        Fixture {
            writer,
            repo,
            staging,
            sink,
        }
    }

    fn department(id: i32) -> Row {
        Row::new(vec![Value::Int(id), Value::Text(format!("Department {}", id))])
    }

    #[tokio::test]
    async fn test_backup_writes_chunks_then_manifest() {
        let f = fixture(10);
        let rows: Vec<_> = (1..=25).map(department).collect();
        f.repo.seed(Table::Departments, rows.clone()).await.unwrap();

        let report = f.writer.backup(Table::Departments).await.unwrap();
        let manifest = &report.manifest;

        assert_eq!(manifest.row_count, 25);
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(manifest.max_id, Some(25));
        assert_eq!(manifest.compression, "snappy");
        let sizes: Vec<_> = manifest.chunks.iter().map(|c| c.rows).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(manifest.backup_path.starts_with("departments/"));

        let stored = f.staging.get(&manifest.manifest_path()).await.unwrap();
        assert_eq!(
            &BackupManifest::from_json(&manifest.manifest_path(), &stored).unwrap(),
            manifest
        );

        let mut restored = Vec::new();
        for chunk in &manifest.chunks {
            let data = f.staging.get(&manifest.chunk_path(chunk)).await.unwrap();
            assert_eq!(sha256_hex(&data), chunk.sha256);
            restored.extend(decode_parquet(Table::Departments.schema(), data).unwrap());
        }
        assert_eq!(restored, rows);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_chunk_size() {
        let f = fixture(5);
        f.repo
            .seed(Table::Departments, (1..=10).map(department).collect())
            .await
            .unwrap();

        let manifest = f.writer.backup(Table::Departments).await.unwrap().manifest;
        assert_eq!(manifest.chunk_count, 2);
        assert_eq!(manifest.row_count, 10);
    }

    #[tokio::test]
    async fn test_empty_table_has_manifest_without_chunks() {
        let f = fixture(10);
        let manifest = f.writer.backup(Table::Jobs).await.unwrap().manifest;
        assert_eq!(manifest.row_count, 0);
        assert!(manifest.chunks.is_empty());
        assert_eq!(manifest.max_id, None);
        assert_eq!(f.staging.len().await, 1);
    }

    #[tokio::test]
    async fn test_each_backup_gets_a_new_directory() {
        let f = fixture(10);
        f.repo.seed(Table::Departments, vec![department(1)]).await.unwrap();

        let first = f.writer.backup(Table::Departments).await.unwrap().manifest;
        let second = f.writer.backup(Table::Departments).await.unwrap().manifest;
        assert_ne!(first.backup_path, second.backup_path);

        let listed = f.writer.list_backups(Table::Departments).await.unwrap();
        let listed: Vec<_> = listed.iter().map(|m| m.backup_path.as_str()).collect();
        assert_eq!(listed, vec![first.backup_path.as_str(), second.backup_path.as_str()]);
    }

    #[tokio::test]
    async fn test_listing_skips_unreadable_manifest() {
        let f = fixture(10);
        f.repo.seed(Table::Departments, vec![department(1)]).await.unwrap();
        let good = f.writer.backup(Table::Departments).await.unwrap().manifest;
        f.staging
            .put(
                "departments/20000101T000000.000000Z/manifest.json",
                Bytes::from_static(b"garbage"),
            )
            .await
            .unwrap();

        let listed = f.writer.list_backups(Table::Departments).await.unwrap();
        assert_eq!(listed, vec![good.clone()]);

        let latest = latest_manifest(f.staging.as_ref(), Table::Departments)
            .await
            .unwrap();
        assert_eq!(latest, Some(good));
    }

    #[tokio::test]
    async fn test_cancelled_backup_publishes_no_manifest() {
        let f = fixture(10);
        f.repo
            .seed(Table::Departments, (1..=30).map(department).collect())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .writer
            .backup_with_cancel(Table::Departments, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
        assert!(f.writer.list_backups(Table::Departments).await.unwrap().is_empty());
    }

    /// Staging store whose chunk uploads always fail
    struct RejectChunks(MemoryStaging);

    #[async_trait::async_trait]
    impl StagingStore for RejectChunks {
        async fn put(&self, path: &str, data: Bytes) -> Result<(), StagingError> {
            if path.ends_with(".parquet") {
                return Err(StagingError::unavailable(path, "bucket offline"));
            }
            self.0.put(path, data).await
        }

        async fn get(&self, path: &str) -> Result<Bytes, StagingError> {
            self.0.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StagingError> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_upload_failure_fails_backup() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Departments, (1..=30).map(department).collect())
            .await
            .unwrap();
        let staging = Arc::new(RejectChunks(MemoryStaging::new()));
        let sink = Arc::new(MemoryLogSink::new());
        let writer = BackupWriter::new(
            Arc::new(repo),
            staging.clone(),
            MigrationLog::new(sink.clone(), Duration::from_secs(1)),
            LoadBarrier::new(),
        )
        .with_chunk_size(10)
        .with_pipeline_depth(1);

        let err = writer.backup(Table::Departments).await.unwrap_err();
        assert!(matches!(err, EngineError::Staging(StagingError::Unavailable { .. })));
        assert!(staging.0.is_empty().await);
        assert!(sink.entries().await.is_empty());
    }

    /// Staging store that commits new rows to the table on the first chunk upload
    struct WriteDuringUpload {
        inner: MemoryStaging,
        repo: MemoryRepository,
    }

    #[async_trait::async_trait]
    impl StagingStore for WriteDuringUpload {
        async fn put(&self, path: &str, data: Bytes) -> Result<(), StagingError> {
            if path.ends_with("part-0000.parquet") {
                self.repo
                    .seed(Table::Departments, (26..=40).map(department).collect())
                    .await
                    .unwrap();
            }
            self.inner.put(path, data).await
        }

        async fn get(&self, path: &str) -> Result<Bytes, StagingError> {
            self.inner.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StagingError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_backup_ignores_writes_made_while_running() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Departments, (1..=25).map(department).collect())
            .await
            .unwrap();
        let staging = Arc::new(WriteDuringUpload {
            inner: MemoryStaging::new(),
            repo: repo.clone(),
        });
        let writer = BackupWriter::new(
            Arc::new(repo.clone()),
            staging,
            MigrationLog::new(Arc::new(MemoryLogSink::new()), Duration::from_secs(1)),
            LoadBarrier::new(),
        )
        .with_chunk_size(10)
        .with_pipeline_depth(1);

        let manifest = writer.backup(Table::Departments).await.unwrap().manifest;

        assert_eq!(repo.row_count(Table::Departments).await.unwrap(), 40);
        assert_eq!(manifest.row_count, 25);
        assert_eq!(manifest.max_id, Some(25));
        let sizes: Vec<_> = manifest.chunks.iter().map(|c| c.rows).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_completion_is_logged() {
        let f = fixture(10);
        f.repo.seed(Table::Departments, vec![department(1)]).await.unwrap();
        f.writer.backup(Table::Departments).await.unwrap();

        let entries = f.sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ErrorKind::BackupCompleted);
        assert_eq!(entries[0].raw_data.as_ref().unwrap()["row_count"], 1);
    }

    #[test]
    fn test_manifest_consistency_is_checked() {
        let manifest = BackupManifest {
            table: Table::Jobs,
            backup_path: "jobs/20240101T000000.000000Z/".into(),
            created_at: Utc::now(),
            row_count: 3,
            chunk_count: 1,
            chunks: vec![ChunkEntry {
                file: "part-0000.parquet".into(),
                rows: 2,
                sha256: String::new(),
            }],
            max_id: Some(3),
            format: FORMAT_TAG.into(),
            compression: COMPRESSION_TAG.into(),
        };
        let data = manifest.to_json().unwrap();
        let err = BackupManifest::from_json("m.json", &data).unwrap_err();
        assert!(matches!(err, EngineError::Manifest { .. }));

        assert!(BackupManifest::from_json("m.json", b"{not json").is_err());
    }
}
