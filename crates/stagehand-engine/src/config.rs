//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::backup::{DEFAULT_CHUNK_SIZE, DEFAULT_PIPELINE_DEPTH};
use crate::db::DbConfig;
use crate::error::{EngineError, EngineResult};
use crate::loader::DEFAULT_LOAD_UNIT_SIZE;
use crate::restore::DEFAULT_RESTORE_RETRIES;
use crate::schema::MAX_BATCH_SIZE;
use crate::storage::StorageConfig;

/// Default bound on a single migration log write, in milliseconds
pub const DEFAULT_LOG_TIMEOUT_MS: u64 = 2000;

/// Directory searched for `{table}.csv` by `migrate_all`
pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub database: DbConfig,
    pub storage: StorageConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Rows per backup chunk, and the default restore write size
    pub chunk_size: usize,
    /// Rows per `COPY` unit during loads
    pub load_unit_size: usize,
    /// Chunks buffered between reader and writer in backup and restore
    pub pipeline_depth: usize,
    pub restore_chunk_retries: usize,
    pub log_timeout_ms: u64,
    pub data_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            load_unit_size: DEFAULT_LOAD_UNIT_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            restore_chunk_retries: DEFAULT_RESTORE_RETRIES,
            log_timeout_ms: DEFAULT_LOG_TIMEOUT_MS,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("STAGEHAND_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            load_unit_size: env_parse("STAGEHAND_LOAD_UNIT_SIZE").unwrap_or(defaults.load_unit_size),
            pipeline_depth: env_parse("STAGEHAND_PIPELINE_DEPTH").unwrap_or(defaults.pipeline_depth),
            restore_chunk_retries: env_parse("STAGEHAND_RESTORE_RETRIES")
                .unwrap_or(defaults.restore_chunk_retries),
            log_timeout_ms: env_parse("STAGEHAND_LOG_TIMEOUT_MS").unwrap_or(defaults.log_timeout_ms),
            data_dir: std::env::var("STAGEHAND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        }
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_millis(self.log_timeout_ms)
    }
}

impl EngineConfig {
    /// Load `.env` if present, then read every section from the environment
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database: DbConfig::from_env()?,
            storage: StorageConfig::from_env(),
            migration: MigrationConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.database.url.is_empty() {
            return Err(EngineError::config("database URL cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(EngineError::config("database max_connections must be greater than 0"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(EngineError::config(format!(
                "database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.storage.bucket.is_empty() {
            return Err(EngineError::config("staging bucket cannot be empty"));
        }

        let migration = &self.migration;
        if migration.chunk_size == 0 {
            return Err(EngineError::config("chunk_size must be greater than 0"));
        }
        if migration.load_unit_size == 0 || migration.load_unit_size > MAX_BATCH_SIZE {
            return Err(EngineError::config(format!(
                "load_unit_size must be within 1..={}",
                MAX_BATCH_SIZE
            )));
        }
        if migration.pipeline_depth == 0 {
            return Err(EngineError::config("pipeline_depth must be greater than 0"));
        }
        if migration.log_timeout_ms == 0 {
            return Err(EngineError::config("log_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.chunk_size, 1000);
        assert_eq!(config.migration.pipeline_depth, 2);
        assert_eq!(config.migration.log_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.migration.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.migration.load_unit_size = 5000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.database.min_connections = 50;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.storage.bucket.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_migration_config_from_env() {
        std::env::set_var("STAGEHAND_CHUNK_SIZE", "250");
        std::env::set_var("STAGEHAND_PIPELINE_DEPTH", "4");
        std::env::set_var("STAGEHAND_DATA_DIR", "/srv/csv");
        std::env::set_var("STAGEHAND_RESTORE_RETRIES", "not-a-number");

        let config = MigrationConfig::from_env();
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.pipeline_depth, 4);
        assert_eq!(config.data_dir, PathBuf::from("/srv/csv"));
        assert_eq!(config.restore_chunk_retries, DEFAULT_RESTORE_RETRIES);

        std::env::remove_var("STAGEHAND_CHUNK_SIZE");
        std::env::remove_var("STAGEHAND_PIPELINE_DEPTH");
        std::env::remove_var("STAGEHAND_DATA_DIR");
        std::env::remove_var("STAGEHAND_RESTORE_RETRIES");
    }

    #[test]
    #[serial]
    fn test_engine_config_from_env() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/stagehand_test");
        std::env::set_var("S3_BUCKET", "backups");

        let config = EngineConfig::from_env().unwrap();
        assert!(config.database.url.ends_with("stagehand_test"));
        assert_eq!(config.storage.bucket, "backups");

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("S3_BUCKET");
    }
}
