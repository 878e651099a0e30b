//! Per-table load barrier
//!
//! Loads, backups and restores of the same table run one at a time inside a
//! process. Different tables proceed independently. Cross-process exclusion is
//! the database writer's advisory lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::schema::Table;

#[derive(Clone)]
pub struct LoadBarrier {
    locks: Arc<HashMap<Table, Arc<Mutex<()>>>>,
}

/// Held for the duration of one table operation
pub struct BarrierGuard {
    table: Table,
    _guard: OwnedMutexGuard<()>,
}

impl BarrierGuard {
    pub fn table(&self) -> Table {
        self.table
    }
}

impl LoadBarrier {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(
                Table::ALL
                    .iter()
                    .map(|t| (*t, Arc::new(Mutex::new(()))))
                    .collect(),
            ),
        }
    }

    pub async fn acquire(&self, table: Table) -> BarrierGuard {
        let started = Instant::now();
        let lock = match self.locks.get(&table) {
            Some(lock) => Arc::clone(lock),
            None => Arc::new(Mutex::new(())),
        };
        let guard = lock.lock_owned().await;
        debug!(
            %table,
            waited_ms = started.elapsed().as_millis() as u64,
            "Load barrier acquired"
        );
        BarrierGuard {
            table,
            _guard: guard,
        }
    }

    pub fn is_held(&self, table: Table) -> bool {
        self.locks
            .get(&table)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

impl Default for LoadBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_table_is_exclusive() {
        let barrier = LoadBarrier::new();
        let guard = barrier.acquire(Table::Jobs).await;
        assert!(barrier.is_held(Table::Jobs));

        let contender = barrier.clone();
        let waiting = tokio::spawn(async move { contender.acquire(Table::Jobs).await.table() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        assert_eq!(waiting.await.unwrap(), Table::Jobs);
    }

    #[tokio::test]
    async fn test_tables_are_independent() {
        let barrier = LoadBarrier::new();
        let _jobs = barrier.acquire(Table::Jobs).await;
        let departments = tokio::time::timeout(
            Duration::from_millis(100),
            barrier.acquire(Table::Departments),
        )
        .await;
        assert!(departments.is_ok());
        assert!(!barrier.is_held(Table::HiredEmployees));
    }
}
