//! Append-only migration log
//!
//! Rejected records, batch summaries and the lifecycle events of loads,
//! backups and restores are written to a [`LogSink`]. Writing never fails the
//! caller: a slow or broken sink marks the log degraded and emits a warning,
//! and every entry is mirrored to `tracing` either way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineResult, ErrorKind};
use crate::schema::Table;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLogSink;
pub use postgres::PgLogSink;

/// Default number of entries returned by a query
pub const DEFAULT_LOG_QUERY_LIMIT: i64 = 100;

/// Upper bound on entries returned by a single query
pub const MAX_LOG_QUERY_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub table: Table,
    pub record_id: Option<i64>,
    pub kind: ErrorKind,
    pub message: String,
    pub raw_data: Option<JsonValue>,
}

impl MigrationLogEntry {
    pub fn new(table: Table, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            table,
            record_id: None,
            kind,
            message: message.into(),
            raw_data: None,
        }
    }

    pub fn with_record_id(mut self, record_id: Option<i64>) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn with_raw(mut self, raw: JsonValue) -> Self {
        self.raw_data = Some(raw);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub table: Option<Table>,
    pub kind: Option<ErrorKind>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            table: None,
            kind: None,
            since: None,
            limit: DEFAULT_LOG_QUERY_LIMIT,
        }
    }
}

impl LogQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_LOG_QUERY_LIMIT)
    }

    pub fn matches(&self, entry: &MigrationLogEntry) -> bool {
        self.table.is_none_or(|t| t == entry.table)
            && self.kind.is_none_or(|k| k == entry.kind)
            && self.since.is_none_or(|s| entry.timestamp >= s)
    }
}

/// Entry counts grouped by table and kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSummaryRow {
    pub table: Table,
    pub kind: ErrorKind,
    pub count: u64,
}

/// Points at the log entries written by one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogReference {
    pub table: Table,
    pub since: DateTime<Utc>,
}

impl LogReference {
    pub fn new(table: Table, since: DateTime<Utc>) -> Self {
        Self { table, since }
    }

    pub fn query(&self) -> LogQuery {
        LogQuery {
            table: Some(self.table),
            since: Some(self.since),
            limit: MAX_LOG_QUERY_LIMIT,
            ..LogQuery::default()
        }
    }
}

impl std::fmt::Display for LogReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data_migration_logs?table={}&since={}",
            self.table,
            self.since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        )
    }
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, entries: &[MigrationLogEntry]) -> EngineResult<()>;

    /// Matching entries, newest first
    async fn query(&self, query: &LogQuery) -> EngineResult<Vec<MigrationLogEntry>>;

    async fn summary(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<LogSummaryRow>>;
}

#[derive(Clone)]
pub struct MigrationLog {
    sink: Arc<dyn LogSink>,
    timeout: Duration,
    degraded: Arc<AtomicBool>,
}

impl MigrationLog {
    pub fn new(sink: Arc<dyn LogSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn record(&self, entry: MigrationLogEntry) {
        self.record_all(vec![entry]).await;
    }

    pub async fn record_all(&self, entries: Vec<MigrationLogEntry>) {
        if entries.is_empty() {
            return;
        }
        entries.iter().for_each(mirror);

        let outcome = tokio::time::timeout(self.timeout, self.sink.write(&entries)).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };

        self.degraded.store(true, Ordering::Relaxed);
        warn!(
            entries = entries.len(),
            error = %failure,
            "Migration log write failed; continuing without it"
        );
    }

    /// True once any write has failed or timed out
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn query(&self, query: &LogQuery) -> EngineResult<Vec<MigrationLogEntry>> {
        self.sink.query(query).await
    }

    pub async fn summary(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<LogSummaryRow>> {
        self.sink.summary(since).await
    }
}

fn mirror(entry: &MigrationLogEntry) {
    let table = entry.table.as_str();
    let kind = entry.kind.as_str();
    if entry.kind.is_failure() {
        warn!(table, kind, record_id = ?entry.record_id, "{}", entry.message);
    } else if entry.kind == ErrorKind::BatchSummary {
        debug!(table, kind, "{}", entry.message);
    } else {
        info!(table, kind, "{}", entry.message);
    }
}
