use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{LogQuery, LogSink, LogSummaryRow, MigrationLogEntry};
use crate::error::{EngineError, EngineResult};

/// Log sink that keeps entries in memory, with switches for failure and
/// latency so degraded-mode handling can be tested
#[derive(Default)]
pub struct MemoryLogSink {
    entries: RwLock<Vec<MigrationLogEntry>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Everything written so far, oldest first
    pub async fn entries(&self) -> Vec<MigrationLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, entries: &[MigrationLogEntry]) -> EngineResult<()> {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::Io(std::io::Error::other("log sink unavailable")));
        }
        self.entries.write().await.extend_from_slice(entries);
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> EngineResult<Vec<MigrationLogEntry>> {
        let limit = query.effective_limit() as usize;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn summary(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<LogSummaryRow>> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.read().await.iter() {
            if since.is_none_or(|s| entry.timestamp >= s) {
                *counts.entry((entry.table, entry.kind)).or_insert(0u64) += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((table, kind), count)| LogSummaryRow { table, kind, count })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::Table;

    #[tokio::test]
    async fn test_query_newest_first_with_limit() {
        let sink = MemoryLogSink::new();
        let entries: Vec<_> = (0..5)
            .map(|i| MigrationLogEntry::new(Table::Jobs, ErrorKind::LoadError, format!("row {}", i)))
            .collect();
        sink.write(&entries).await.unwrap();

        let found = sink
            .query(&LogQuery {
                limit: 2,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        let messages: Vec<_> = found.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["row 4", "row 3"]);
    }

    #[tokio::test]
    async fn test_summary_counts_by_table_and_kind() {
        let sink = MemoryLogSink::new();
        sink.write(&[
            MigrationLogEntry::new(Table::Jobs, ErrorKind::LoadError, "a"),
            MigrationLogEntry::new(Table::Jobs, ErrorKind::LoadError, "b"),
            MigrationLogEntry::new(Table::Departments, ErrorKind::ValidationError, "c"),
        ])
        .await
        .unwrap();

        let summary = sink.summary(None).await.unwrap();
        assert_eq!(
            summary,
            vec![
                LogSummaryRow {
                    table: Table::Departments,
                    kind: ErrorKind::ValidationError,
                    count: 1
                },
                LogSummaryRow {
                    table: Table::Jobs,
                    kind: ErrorKind::LoadError,
                    count: 2
                },
            ]
        );
    }
}
