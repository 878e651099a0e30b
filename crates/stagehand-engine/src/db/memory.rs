use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    referenced_tables, DbError, DbResult, ReferenceSnapshot, Repository, TableSnapshot,
    TableWriter,
};
use crate::schema::{Row, Table, Value};

#[derive(Debug, Clone)]
struct MemoryTable {
    rows: BTreeMap<i32, Row>,
    /// Next value of the identity generator; explicit identifiers do not advance it
    next_identity: i64,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_identity: 1,
        }
    }
}

impl MemoryTable {
    /// All-or-nothing insert with primary key checks. Identity values handed
    /// out stay consumed when the unit is rejected, like a sequence's.
    fn insert_all(&mut self, rows: &[Row]) -> DbResult<u64> {
        let mut staged = Vec::with_capacity(rows.len());
        let mut seen = HashSet::new();

        for row in rows {
            let mut row = row.clone();
            let id = match row.id() {
                Some(id) => id,
                None => {
                    let id = i32::try_from(self.next_identity)
                        .map_err(|_| DbError::rejected("identity generator exhausted"))?;
                    self.next_identity += 1;
                    row.values[0] = Value::Int(id);
                    id
                },
            };
            if self.rows.contains_key(&id) || !seen.insert(id) {
                return Err(DbError::rejected(format!(
                    "duplicate key value violates unique constraint: id={}",
                    id
                )));
            }
            staged.push((id, row));
        }

        let count = staged.len() as u64;
        self.rows.extend(staged);
        Ok(count)
    }
}

fn keyset_chunk(rows: &BTreeMap<i32, Row>, after_id: Option<i32>, limit: usize) -> Vec<Row> {
    match after_id {
        Some(after) => rows
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect(),
        None => rows.values().take(limit).cloned().collect(),
    }
}

/// In-memory repository with PostgreSQL-like write semantics: writers work on
/// a private copy that replaces the table on commit, a duplicate identifier
/// rejects the whole unit, and one writer per table is active at a time.
#[derive(Clone)]
pub struct MemoryRepository {
    tables: Arc<Mutex<HashMap<Table, MemoryTable>>>,
    locks: Arc<HashMap<Table, Arc<Mutex<()>>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: Arc::default(),
            locks: Arc::new(
                Table::ALL
                    .iter()
                    .map(|t| (*t, Arc::new(Mutex::new(()))))
                    .collect(),
            ),
        }
    }

    /// Insert rows directly, bypassing validation
    pub async fn seed(&self, table: Table, rows: Vec<Row>) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        tables.entry(table).or_default().insert_all(&rows)?;
        Ok(())
    }

    /// Current rows of `table` ordered by identifier
    pub async fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(&table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn next_identity(&self, table: Table) -> i64 {
        self.tables
            .lock()
            .await
            .get(&table)
            .map_or(1, |t| t.next_identity)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn reference_snapshot(&self) -> DbResult<ReferenceSnapshot> {
        let tables = self.tables.lock().await;
        let ids = referenced_tables()
            .into_iter()
            .map(|table| {
                let ids: HashSet<i32> = tables
                    .get(&table)
                    .map(|t| t.rows.keys().copied().collect())
                    .unwrap_or_default();
                (table, ids)
            })
            .collect();
        Ok(ReferenceSnapshot::new(ids))
    }

    async fn existing_ids(&self, table: Table, ids: &[i32]) -> DbResult<HashSet<i32>> {
        let tables = self.tables.lock().await;
        Ok(match tables.get(&table) {
            Some(t) => ids.iter().copied().filter(|id| t.rows.contains_key(id)).collect(),
            None => HashSet::new(),
        })
    }

    async fn read_chunk(
        &self,
        table: Table,
        after_id: Option<i32>,
        limit: usize,
    ) -> DbResult<Vec<Row>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .map(|t| keyset_chunk(&t.rows, after_id, limit))
            .unwrap_or_default())
    }

    async fn row_count(&self, table: Table) -> DbResult<u64> {
        let tables = self.tables.lock().await;
        Ok(tables.get(&table).map_or(0, |t| t.rows.len() as u64))
    }

    async fn snapshot(&self, table: Table) -> DbResult<Box<dyn TableSnapshot>> {
        let rows = self
            .tables
            .lock()
            .await
            .get(&table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        Ok(Box::new(MemoryTableSnapshot { rows }))
    }

    async fn writer(&self, table: Table) -> DbResult<Box<dyn TableWriter>> {
        let lock = self
            .locks
            .get(&table)
            .cloned()
            .ok_or_else(|| DbError::config(format!("no lock registered for {}", table)))?;
        let guard = lock.lock_owned().await;
        let working = self
            .tables
            .lock()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default();

        Ok(Box::new(MemoryTableWriter {
            tables: Arc::clone(&self.tables),
            table,
            working,
            _guard: guard,
        }))
    }
}

/// Copy of the committed rows taken when the snapshot opened
pub struct MemoryTableSnapshot {
    rows: BTreeMap<i32, Row>,
}

#[async_trait]
impl TableSnapshot for MemoryTableSnapshot {
    async fn read_chunk(&mut self, after_id: Option<i32>, limit: usize) -> DbResult<Vec<Row>> {
        Ok(keyset_chunk(&self.rows, after_id, limit))
    }
}

pub struct MemoryTableWriter {
    tables: Arc<Mutex<HashMap<Table, MemoryTable>>>,
    table: Table,
    working: MemoryTable,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl TableWriter for MemoryTableWriter {
    async fn truncate(&mut self) -> DbResult<()> {
        self.working.rows.clear();
        Ok(())
    }

    async fn copy_rows(&mut self, rows: &[Row]) -> DbResult<u64> {
        self.working.insert_all(rows)
    }

    async fn insert_row(&mut self, row: &Row) -> DbResult<()> {
        self.working.insert_all(std::slice::from_ref(row)).map(|_| ())
    }

    async fn reconcile_identity(&mut self) -> DbResult<Option<i64>> {
        if !self.table.schema().identity {
            return Ok(None);
        }
        let max = self.working.rows.keys().next_back().copied().unwrap_or(0);
        self.working.next_identity = i64::from(max) + 1;
        Ok(Some(self.working.next_identity))
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let MemoryTableWriter {
            tables,
            table,
            working,
            _guard,
        } = *self;
        tables.lock().await.insert(table, working);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn job(id: i32, name: &str) -> Row {
        Row::new(vec![Value::Int(id), Value::Text(name.to_string())])
    }

    #[tokio::test]
    async fn test_duplicate_rejects_whole_unit() {
        let repo = MemoryRepository::new();
        let mut writer = repo.writer(Table::Jobs).await.unwrap();

        writer.copy_rows(&[job(1, "Engineer")]).await.unwrap();
        let err = writer
            .copy_rows(&[job(2, "Analyst"), job(1, "Again")])
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        writer.insert_row(&job(2, "Analyst")).await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(repo.rows(Table::Jobs).await, vec![job(1, "Engineer"), job(2, "Analyst")]);
    }

    #[tokio::test]
    async fn test_uncommitted_writer_changes_nothing() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Jobs, vec![job(1, "Engineer")]).await.unwrap();

        {
            let mut writer = repo.writer(Table::Jobs).await.unwrap();
            writer.truncate().await.unwrap();
        }

        assert_eq!(repo.row_count(Table::Jobs).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identity_generation_and_reconcile() {
        let repo = MemoryRepository::new();
        let employee = |id: Option<i32>| {
            Row::new(vec![
                id.map(Value::Int).unwrap_or(Value::Null),
                Value::Text("Ana".into()),
                Value::Null,
                Value::Int(1),
                Value::Int(1),
            ])
        };

        let mut writer = repo.writer(Table::HiredEmployees).await.unwrap();
        writer.copy_rows(&[employee(Some(10))]).await.unwrap();
        writer.copy_rows(&[employee(None)]).await.unwrap();
        assert_eq!(writer.reconcile_identity().await.unwrap(), Some(11));
        writer.commit().await.unwrap();

        let ids: Vec<_> = repo
            .rows(Table::HiredEmployees)
            .await
            .iter()
            .filter_map(Row::id)
            .collect();
        assert_eq!(ids, vec![1, 10]);
        assert_eq!(repo.next_identity(Table::HiredEmployees).await, 11);
    }

    #[tokio::test]
    async fn test_rejected_unit_still_consumes_identity_values() {
        let repo = MemoryRepository::new();
        let employee = |id: Option<i32>| {
            Row::new(vec![
                id.map(Value::Int).unwrap_or(Value::Null),
                Value::Text("Ana".into()),
                Value::Null,
                Value::Int(1),
                Value::Int(1),
            ])
        };
        let unit = [employee(Some(1)), employee(None)];

        let mut writer = repo.writer(Table::HiredEmployees).await.unwrap();
        assert!(writer.copy_rows(&unit).await.unwrap_err().is_rejection());

        // Row by row the generated identifier no longer collides
        writer.insert_row(&unit[0]).await.unwrap();
        writer.insert_row(&unit[1]).await.unwrap();
        writer.commit().await.unwrap();

        let ids: Vec<_> = repo
            .rows(Table::HiredEmployees)
            .await
            .iter()
            .filter_map(Row::id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(repo.next_identity(Table::HiredEmployees).await, 3);
    }

    #[tokio::test]
    async fn test_read_chunk_is_keyset_ordered() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Jobs, (1..=5).rev().map(|i| job(i, "Job")).collect())
            .await
            .unwrap();

        let first = repo.read_chunk(Table::Jobs, None, 2).await.unwrap();
        assert_eq!(first.iter().filter_map(Row::id).collect::<Vec<_>>(), vec![1, 2]);
        let next = repo.read_chunk(Table::Jobs, Some(2), 2).await.unwrap();
        assert_eq!(next.iter().filter_map(Row::id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_snapshot_ignores_later_commits() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Jobs, (1..=3).map(|i| job(i, "Job")).collect())
            .await
            .unwrap();
        let mut snapshot = repo.snapshot(Table::Jobs).await.unwrap();

        let first = snapshot.read_chunk(None, 2).await.unwrap();
        let mut writer = repo.writer(Table::Jobs).await.unwrap();
        writer.truncate().await.unwrap();
        writer.copy_rows(&[job(3, "Changed"), job(9, "New")]).await.unwrap();
        writer.commit().await.unwrap();
        let rest = snapshot.read_chunk(Some(2), 2).await.unwrap();

        assert_eq!(first, vec![job(1, "Job"), job(2, "Job")]);
        assert_eq!(rest, vec![job(3, "Job")]);
        assert_eq!(repo.row_count(Table::Jobs).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reference_snapshot_and_existing_ids() {
        let repo = MemoryRepository::new();
        repo.seed(Table::Departments, vec![job(1, "Sales")]).await.unwrap();
        repo.seed(Table::Jobs, vec![job(4, "Engineer")]).await.unwrap();

        let snapshot = repo.reference_snapshot().await.unwrap();
        assert!(snapshot.contains(Table::Departments, 1));
        assert!(snapshot.contains(Table::Jobs, 4));

        let existing = repo.existing_ids(Table::Jobs, &[3, 4]).await.unwrap();
        assert_eq!(existing, HashSet::from([4]));
    }
}
