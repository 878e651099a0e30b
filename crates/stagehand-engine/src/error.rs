//! Engine error types and the migration log taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;
use crate::storage::StagingError;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Infrastructure failures. Rejected records are reported as values in
/// operation reports and in the migration log, never through this type.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Staging store error: {0}")]
    Staging(#[from] StagingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Write rejected by the database: {0}")]
    Rejected(String),

    #[error("No backup found for table '{table}'")]
    NoBackupFound { table: String },

    #[error("Invalid backup manifest at {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn manifest(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlx(e) => Self::Database(e),
            DbError::Config(message) => Self::Config(message),
            DbError::Rejected(message) => Self::Rejected(message),
        }
    }
}

/// Kind tag of a migration log entry.
///
/// The first group classifies rejected records and failures, the second group
/// marks lifecycle events of loads, backups and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MissingRequiredFields,
    ValidationError,
    ForeignKeyUnresolved,
    DuplicateIdentifier,
    LoadError,
    StagingUnavailable,
    StagedObjectMissing,
    NoBackupFound,
    RestoreChunkFailed,
    BatchSummary,
    LoadStarted,
    LoadCompleted,
    BackupCompleted,
    RestoreStarted,
    RestoreCompleted,
    RestoreCancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 16] = [
        Self::MissingRequiredFields,
        Self::ValidationError,
        Self::ForeignKeyUnresolved,
        Self::DuplicateIdentifier,
        Self::LoadError,
        Self::StagingUnavailable,
        Self::StagedObjectMissing,
        Self::NoBackupFound,
        Self::RestoreChunkFailed,
        Self::BatchSummary,
        Self::LoadStarted,
        Self::LoadCompleted,
        Self::BackupCompleted,
        Self::RestoreStarted,
        Self::RestoreCompleted,
        Self::RestoreCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRequiredFields => "MISSING_REQUIRED_FIELDS",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ForeignKeyUnresolved => "FOREIGN_KEY_UNRESOLVED",
            Self::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            Self::LoadError => "LOAD_ERROR",
            Self::StagingUnavailable => "STAGING_UNAVAILABLE",
            Self::StagedObjectMissing => "STAGED_OBJECT_MISSING",
            Self::NoBackupFound => "NO_BACKUP_FOUND",
            Self::RestoreChunkFailed => "RESTORE_CHUNK_FAILED",
            Self::BatchSummary => "BATCH_SUMMARY",
            Self::LoadStarted => "LOAD_STARTED",
            Self::LoadCompleted => "LOAD_COMPLETED",
            Self::BackupCompleted => "BACKUP_COMPLETED",
            Self::RestoreStarted => "RESTORE_STARTED",
            Self::RestoreCompleted => "RESTORE_COMPLETED",
            Self::RestoreCancelled => "RESTORE_CANCELLED",
        }
    }

    /// True for kinds that describe a problem rather than a lifecycle event
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingRequiredFields
                | Self::ValidationError
                | Self::ForeignKeyUnresolved
                | Self::DuplicateIdentifier
                | Self::LoadError
                | Self::StagingUnavailable
                | Self::StagedObjectMissing
                | Self::NoBackupFound
                | Self::RestoreChunkFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == normalized)
            .copied()
            .ok_or_else(|| EngineError::config(format!("unknown error kind '{}'", s)))
    }
}
