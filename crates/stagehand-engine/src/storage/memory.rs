use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{StagingError, StagingResult, StagingStore};

/// In-process staging store.
///
/// Objects are kept in a sorted map, so listing order matches S3. Individual
/// paths can be made to fail with `Unavailable` to exercise retry handling.
#[derive(Default)]
pub struct MemoryStaging {
    objects: RwLock<BTreeMap<String, Bytes>>,
    /// Failing paths, with the failures left before they heal on their own
    failing: RwLock<HashMap<String, Option<usize>>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` and `put` of `path` fail until [`Self::heal`] is called
    pub async fn fail_path(&self, path: impl Into<String>) {
        self.failing.write().await.insert(path.into(), None);
    }

    /// Make the next `times` accesses of `path` fail, then succeed again
    pub async fn fail_times(&self, path: impl Into<String>, times: usize) {
        if times > 0 {
            self.failing.write().await.insert(path.into(), Some(times));
        }
    }

    pub async fn heal(&self, path: &str) {
        self.failing.write().await.remove(path);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    async fn check(&self, path: &str) -> StagingResult<()> {
        let mut failing = self.failing.write().await;
        let Some(remaining) = failing.get_mut(path) else {
            return Ok(());
        };
        if let Some(left) = remaining {
            *left -= 1;
            if *left == 0 {
                failing.remove(path);
            }
        }
        Err(StagingError::unavailable(path, "injected failure"))
    }
}

#[async_trait]
impl StagingStore for MemoryStaging {
    async fn put(&self, path: &str, data: Bytes) -> StagingResult<()> {
        self.check(path).await?;
        self.objects.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> StagingResult<Bytes> {
        self.check(path).await?;
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StagingError::not_found(path))
    }

    async fn list(&self, prefix: &str) -> StagingResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn uri(&self, path: &str) -> String {
        format!("memory://{}", path)
    }
}
