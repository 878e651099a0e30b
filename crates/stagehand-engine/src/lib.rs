//! Stagehand Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bulk migration and backup/restore between PostgreSQL and S3-compatible
//! object storage.
//!
//! # Overview
//!
//! - **Validation**: batches of 1 to 1000 records are checked against a static
//!   schema registry and the current reference tables; rejected records are
//!   logged and never block accepted ones
//! - **Staging**: accepted rows are written as raw CSV to the staging store
//! - **Loading**: a staged CSV replaces (or extends) a table inside one
//!   transaction with `COPY` units of 1000 rows
//! - **Backup**: tables are exported as Snappy-compressed Parquet chunks plus
//!   a manifest under a fresh timestamped path
//! - **Restore**: the latest (or a named) backup is replayed with original
//!   identifiers and the identity generator is moved past them
//! - **Migration log**: every rejection and every load, backup and restore
//!   event lands in `data_migration_logs`
//!
//! Loads, backups and restores of one table are mutually exclusive; different
//! tables proceed independently.
//!
//! # Example
//!
//! ```no_run
//! use stagehand_engine::{EngineConfig, MigrationEngine, Table};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = MigrationEngine::connect(EngineConfig::from_env()?).await?;
//!     let report = engine.backup(Table::HiredEmployees).await?;
//!     println!("{} rows in {}", report.manifest.row_count, report.manifest.backup_path);
//!     let restored = engine.restore(Table::HiredEmployees, None, None).await?;
//!     println!("{} rows restored", restored.rows_restored);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod barrier;
pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod loader;
pub mod migration_log;
pub mod paths;
pub mod restore;
pub mod schema;
pub mod source;
pub mod storage;
pub mod validator;

pub use backup::{BackupManifest, BackupReport, BackupWriter, ChunkEntry};
pub use barrier::LoadBarrier;
pub use config::{EngineConfig, MigrationConfig};
pub use engine::{BatchError, BatchReport, MigrationEngine, MigrationReport, TableOutcome};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use loader::{BulkLoader, LoadMode, LoadReport};
pub use migration_log::{
    LogQuery, LogReference, LogSink, LogSummaryRow, MigrationLog, MigrationLogEntry,
};
pub use paths::{StagedFormat, StagedObject};
pub use restore::{RestoreReader, RestoreReport};
pub use schema::{Batch, Record, Row, Table, TableSchema, Value};
pub use validator::{ValidationResult, Validator};
