//! Staging store client
//!
//! Byte blobs (raw CSV stages, Parquet chunks, manifests) live at
//! slash-separated paths in an object store. [`S3Staging`] talks to S3 or any
//! S3-compatible service such as MinIO; [`MemoryStaging`] keeps everything in
//! process for tests and dry runs.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, error::DisplayErrorContext, primitives::ByteStream, Client};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;
pub mod memory;

pub use config::StorageConfig;
pub use memory::MemoryStaging;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    #[error("Object not found: {path}")]
    NotFound { path: String },

    #[error("Staging store unavailable while accessing {path}: {reason}")]
    Unavailable { path: String, reason: String },
}

impl StagingError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn unavailable(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type StagingResult<T> = std::result::Result<T, StagingError>;

/// Object storage used for raw stages and backups.
///
/// `put` replaces the whole object at once; readers never observe a partial
/// write.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes) -> StagingResult<()>;

    async fn get(&self, path: &str) -> StagingResult<Bytes>;

    /// All paths under `prefix`, sorted lexicographically
    async fn list(&self, prefix: &str) -> StagingResult<Vec<String>>;

    /// Fully qualified location for reports and log messages
    fn uri(&self, path: &str) -> String {
        path.to_string()
    }
}

#[derive(Clone)]
pub struct S3Staging {
    client: Client,
    bucket: String,
}

impl S3Staging {
    pub async fn new(config: StorageConfig) -> Self {
        debug!(?config, "Initializing staging store");

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "stagehand-static",
            ));
        }

        let shared = loader.load().await;
        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Staging store client initialized");

        Self {
            client,
            bucket: config.bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist yet
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> StagingResult<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StagingError::unavailable(&self.bucket, DisplayErrorContext(&e)))?;

        info!("Created staging bucket");
        Ok(())
    }
}

#[async_trait]
impl StagingStore for S3Staging {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> StagingResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StagingError::unavailable(path, DisplayErrorContext(&e)))?;

        debug!("Uploaded to s3://{}/{}", self.bucket, path);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> StagingResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StagingError::not_found(path)
                } else {
                    StagingError::unavailable(path, DisplayErrorContext(&e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StagingError::unavailable(path, e))?
            .into_bytes();

        debug!(bytes = data.len(), "Downloaded s3://{}/{}", self.bucket, path);
        Ok(data)
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> StagingResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StagingError::unavailable(prefix, DisplayErrorContext(&e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                },
                _ => break,
            }
        }

        keys.sort();
        debug!(count = keys.len(), "Listed staging objects");
        Ok(keys)
    }

    fn uri(&self, path: &str) -> String {
        format!("s3://{}/{}", self.bucket, path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_path() {
        let err = StagingError::not_found("jobs/raw/x.csv");
        assert!(err.to_string().contains("jobs/raw/x.csv"));

        let err = StagingError::unavailable("jobs/", "connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_s3_uri_includes_bucket() {
        let staging = S3Staging::new(StorageConfig::for_minio("http://localhost:9000", "stage")).await;
        assert_eq!(staging.uri("jobs/raw/a.csv"), "s3://stage/jobs/raw/a.csv");
        assert_eq!(staging.bucket(), "stage");
    }
}
