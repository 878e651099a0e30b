//! Shared fixtures for engine integration tests
//!
//! Builds a [`MigrationEngine`] on the in-memory repository, staging store and
//! log sink, and provides record builders for the three tables.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;

use stagehand_engine::db::MemoryRepository;
use stagehand_engine::migration_log::MemoryLogSink;
use stagehand_engine::storage::MemoryStaging;
use stagehand_engine::{EngineConfig, MigrationEngine, Record, Table};

pub const HIRED_AT: &str = "2021-07-27T16:02:08Z";

pub struct TestEngine {
    pub engine: MigrationEngine,
    pub repo: MemoryRepository,
    pub staging: Arc<MemoryStaging>,
    pub sink: Arc<MemoryLogSink>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let repo = MemoryRepository::new();
        let staging = Arc::new(MemoryStaging::new());
        let sink = Arc::new(MemoryLogSink::new());
        let engine = MigrationEngine::new(
            config,
            Arc::new(repo.clone()),
            staging.clone(),
            sink.clone(),
        )
        .expect("engine");
        Self {
            engine,
            repo,
            staging,
            sink,
        }
    }

    /// Departments and jobs 1..=3 through the online path
    pub async fn seed_reference_tables(&self) {
        let departments = (1..=3).map(|i| department(i, "Supply Chain")).collect();
        let jobs = (1..=3).map(|i| job(i, "Recruiter")).collect();
        let report = self
            .engine
            .submit_batch(Table::Departments, departments)
            .await
            .expect("departments");
        assert_eq!(report.success_count, 3);
        let report = self.engine.submit_batch(Table::Jobs, jobs).await.expect("jobs");
        assert_eq!(report.success_count, 3);
    }

    pub async fn employee_ids(&self) -> Vec<i32> {
        self.repo
            .rows(Table::HiredEmployees)
            .await
            .iter()
            .filter_map(|row| row.id())
            .collect()
    }
}

pub fn department(id: i64, name: &str) -> Record {
    Record::new().with("id", json!(id)).with("name", json!(name))
}

pub fn job(id: i64, name: &str) -> Record {
    Record::new().with("id", json!(id)).with("name", json!(name))
}

/// Employee with an explicit identifier, or a generated one when `id` is `None`
pub fn employee(id: Option<i64>, name: &str, department_id: i64, job_id: i64) -> Record {
    let record = Record::new()
        .with("name", json!(name))
        .with("datetime", json!(HIRED_AT))
        .with("department_id", json!(department_id))
        .with("job_id", json!(job_id));
    match id {
        Some(id) => record.with("id", json!(id)),
        None => record,
    }
}
