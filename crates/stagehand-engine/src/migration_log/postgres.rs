use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _};
use tracing::debug;

use super::{LogQuery, LogSink, LogSummaryRow, MigrationLogEntry};
use crate::error::{EngineResult, ErrorKind};
use crate::schema::Table;

/// Rows per INSERT statement; six binds each keeps us well under the
/// protocol's parameter limit
const INSERT_CHUNK: usize = 1000;

/// Writes entries to the `data_migration_logs` table
#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn write(&self, entries: &[MigrationLogEntry]) -> EngineResult<()> {
        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO data_migration_logs (
                    timestamp, table_name, record_id, error_type, error_message, raw_data
                )
                "#,
            );

            query_builder.push_values(chunk, |mut b, entry| {
                b.push_bind(entry.timestamp)
                    .push_bind(entry.table.as_str())
                    .push_bind(entry.record_id)
                    .push_bind(entry.kind.as_str())
                    .push_bind(&entry.message)
                    .push_bind(&entry.raw_data);
            });

            query_builder.build().execute(&self.pool).await?;
        }
        debug!(count = entries.len(), "Wrote migration log entries");
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> EngineResult<Vec<MigrationLogEntry>> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            SELECT timestamp, table_name, record_id, error_type, error_message, raw_data
            FROM data_migration_logs
            WHERE 1=1
            "#,
        );

        if let Some(table) = query.table {
            query_builder.push(" AND table_name = ").push_bind(table.as_str());
        }
        if let Some(kind) = query.kind {
            query_builder.push(" AND error_type = ").push_bind(kind.as_str());
        }
        if let Some(since) = query.since {
            query_builder.push(" AND timestamp >= ").push_bind(since);
        }
        query_builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(query.effective_limit());

        let rows = query_builder.build().fetch_all(&self.pool).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let kind: String = row.try_get("error_type")?;
            entries.push(MigrationLogEntry {
                timestamp: row.try_get("timestamp")?,
                table: table.parse::<Table>()?,
                record_id: row.try_get("record_id")?,
                kind: kind.parse::<ErrorKind>()?,
                message: row.try_get("error_message")?,
                raw_data: row.try_get::<Option<JsonValue>, _>("raw_data")?,
            });
        }

        debug!(count = entries.len(), "Queried migration log");
        Ok(entries)
    }

    async fn summary(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<LogSummaryRow>> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT table_name, error_type, COUNT(*) AS count FROM data_migration_logs",
        );
        if let Some(since) = since {
            query_builder.push(" WHERE timestamp >= ").push_bind(since);
        }
        query_builder.push(" GROUP BY table_name, error_type ORDER BY table_name, error_type");

        let rows = query_builder.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> EngineResult<LogSummaryRow> {
                let table: String = row.try_get("table_name")?;
                let kind: String = row.try_get("error_type")?;
                let count: i64 = row.try_get("count")?;
                Ok(LogSummaryRow {
                    table: table.parse()?,
                    kind: kind.parse()?,
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }
}
