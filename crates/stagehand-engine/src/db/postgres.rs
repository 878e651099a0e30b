use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row as _, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

use super::{
    create_pool, referenced_tables, DbConfig, DbResult, ReferenceSnapshot, Repository,
    TableSnapshot, TableWriter,
};
use crate::codec::csv::encode_copy_text;
use crate::schema::{FieldType, Row, Table, TableSchema, Value};

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig) -> DbResult<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_row(schema: &TableSchema, row: &PgRow) -> DbResult<Row> {
    let mut values = Vec::with_capacity(schema.fields.len());
    for (i, field) in schema.fields.iter().enumerate() {
        let value = match field.field_type {
            FieldType::Integer => row.try_get::<Option<i32>, _>(i)?.map(Value::Int),
            FieldType::Text => row.try_get::<Option<String>, _>(i)?.map(Value::Text),
            FieldType::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(Value::Timestamp),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row::new(values))
}

#[async_trait]
impl Repository for PgRepository {
    #[instrument(skip(self))]
    async fn reference_snapshot(&self) -> DbResult<ReferenceSnapshot> {
        let mut ids = HashMap::new();
        for table in referenced_tables() {
            let sql = format!("SELECT id FROM {}", table);
            let rows: Vec<i32> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
            debug!(%table, count = rows.len(), "Loaded reference identifiers");
            ids.insert(table, rows.into_iter().collect::<HashSet<_>>());
        }
        Ok(ReferenceSnapshot::new(ids))
    }

    async fn existing_ids(&self, table: Table, ids: &[i32]) -> DbResult<HashSet<i32>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1)", table);
        let found: Vec<i32> = sqlx::query_scalar(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(found.into_iter().collect())
    }

    async fn read_chunk(
        &self,
        table: Table,
        after_id: Option<i32>,
        limit: usize,
    ) -> DbResult<Vec<Row>> {
        let mut conn = self.pool.acquire().await?;
        fetch_chunk(&mut *conn, table, after_id, limit).await
    }

    async fn row_count(&self, table: Table) -> DbResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn snapshot(&self, table: Table) -> DbResult<Box<dyn TableSnapshot>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        debug!("Opened repeatable read snapshot");
        Ok(Box::new(PgTableSnapshot { tx, table }))
    }

    #[instrument(skip(self))]
    async fn writer(&self, table: Table) -> DbResult<Box<dyn TableWriter>> {
        let mut tx = self.pool.begin().await?;

        // Serializes loads, backups and restores of one table across processes
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(table.lock_key())
            .execute(&mut *tx)
            .await?;

        debug!("Acquired table write lock");
        Ok(Box::new(PgTableWriter { tx, table }))
    }
}

async fn fetch_chunk(
    conn: &mut PgConnection,
    table: Table,
    after_id: Option<i32>,
    limit: usize,
) -> DbResult<Vec<Row>> {
    let schema = table.schema();
    let sql = format!(
        "SELECT {} FROM {} WHERE id > $1 ORDER BY id LIMIT $2",
        schema.column_names().join(", "),
        table
    );
    let rows = sqlx::query(&sql)
        .bind(after_id.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(conn)
        .await?;

    rows.iter().map(|r| decode_row(schema, r)).collect()
}

/// Read-only repeatable read transaction; dropping it rolls back
pub struct PgTableSnapshot {
    tx: Transaction<'static, Postgres>,
    table: Table,
}

#[async_trait]
impl TableSnapshot for PgTableSnapshot {
    async fn read_chunk(&mut self, after_id: Option<i32>, limit: usize) -> DbResult<Vec<Row>> {
        fetch_chunk(&mut *self.tx, self.table, after_id, limit).await
    }
}

pub struct PgTableWriter {
    tx: Transaction<'static, Postgres>,
    table: Table,
}

fn copy_statement(table: Table, columns: &[usize]) -> String {
    let names: Vec<&str> = columns
        .iter()
        .map(|&i| table.schema().fields[i].name)
        .collect();
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        table,
        names.join(", ")
    )
}

async fn copy_in(conn: &mut PgConnection, statement: &str, data: &str) -> Result<u64, sqlx::Error> {
    let mut copy = conn.copy_in_raw(statement).await?;
    if let Err(e) = copy.send(data.as_bytes()).await {
        let _ = copy.abort(e.to_string()).await;
        return Err(e);
    }
    copy.finish().await
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    field_type: FieldType,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match (value, field_type) {
        (Value::Int(v), _) => query.bind(*v),
        (Value::Text(s), _) => query.bind(s.clone()),
        (Value::Timestamp(ts), _) => query.bind(*ts),
        (Value::Null, FieldType::Integer) => query.bind(None::<i32>),
        (Value::Null, FieldType::Text) => query.bind(None::<String>),
        (Value::Null, FieldType::Timestamp) => query.bind(None::<DateTime<Utc>>),
    }
}

/// Columns to write for a row: rows without an identifier let the database
/// assign one.
fn write_columns(schema: &TableSchema, with_id: bool) -> Vec<usize> {
    let start = if with_id { 0 } else { 1 };
    (start..schema.fields.len()).collect()
}

#[async_trait]
impl TableWriter for PgTableWriter {
    async fn truncate(&mut self) -> DbResult<()> {
        sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(&mut *self.tx)
            .await?;
        debug!(table = %self.table, "Truncated");
        Ok(())
    }

    async fn copy_rows(&mut self, rows: &[Row]) -> DbResult<u64> {
        let schema = self.table.schema();
        let (with_id, without_id): (Vec<&Row>, Vec<&Row>) =
            rows.iter().partition(|r| r.id().is_some());

        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let mut result = Ok(0u64);

        for (group, has_id) in [(with_id, true), (without_id, false)] {
            if group.is_empty() {
                continue;
            }
            let columns = write_columns(schema, has_id);
            let statement = copy_statement(self.table, &columns);
            let data = encode_copy_text(group, &columns);
            match copy_in(&mut savepoint, &statement, &data).await {
                Ok(n) => {
                    result = result.map(|total| total + n);
                },
                Err(e) => {
                    result = Err(e);
                    break;
                },
            }
        }

        match result {
            Ok(copied) => {
                savepoint.commit().await?;
                Ok(copied)
            },
            Err(e) => {
                savepoint.rollback().await?;
                Err(e.into())
            },
        }
    }

    async fn insert_row(&mut self, row: &Row) -> DbResult<()> {
        let schema = self.table.schema();
        let columns = write_columns(schema, row.id().is_some());
        let names: Vec<&str> = columns.iter().map(|&i| schema.fields[i].name).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${}", n)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            names.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for &i in &columns {
            query = bind_value(query, schema.fields[i].field_type, row.get(i));
        }

        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        match query.execute(&mut *savepoint).await {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            },
            Err(e) => {
                savepoint.rollback().await?;
                Err(e.into())
            },
        }
    }

    async fn reconcile_identity(&mut self) -> DbResult<Option<i64>> {
        if !self.table.schema().identity {
            return Ok(None);
        }
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence('{table}', 'id'), COALESCE(MAX(id), 0) + 1, false) FROM {table}",
            table = self.table
        );
        let next: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *self.tx).await?;
        debug!(table = %self.table, next, "Identity generator reconciled");
        Ok(Some(next))
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let PgTableWriter { tx, table } = *self;
        tx.commit().await?;
        debug!(%table, "Write transaction committed");
        Ok(())
    }
}
