//! Engine integration tests against the in-memory backends
//!
//! Coverage includes:
//! - Online batches with mixed valid and invalid records
//! - Historical CSV migrations and their convergence
//! - Backup and restore round trips with identity continuity
//! - Latest-manifest selection and concurrent backups
//! - Degraded migration log

use std::io::Write;
use std::time::Duration;

use stagehand_engine::{ErrorKind, LogQuery, Table, TableOutcome};

mod common;
use common::{department, employee, job, TestEngine};

// ============================================================================
// Online batches
// ============================================================================

#[tokio::test]
async fn test_invalid_records_do_not_block_valid_ones() {
    let t = TestEngine::new();
    t.seed_reference_tables().await;

    let mut future = employee(Some(4), "Future Hire", 1, 1);
    future = future.with("datetime", "2999-01-01T00:00:00Z");

    let report = t
        .engine
        .submit_batch(
            Table::HiredEmployees,
            vec![
                employee(Some(1), "Marcelo Gonzalez", 1, 2),
                employee(Some(2), "Lidia Mendez", 99, 2),
                employee(Some(3), "", 1, 1),
                future,
                employee(Some(5), "Ana Torres", 3, 3),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.success_count, 2);
    assert_eq!(report.error_count, 3);
    let kinds: Vec<_> = report.errors.iter().map(|e| (e.index, e.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (1, ErrorKind::ForeignKeyUnresolved),
            (2, ErrorKind::MissingRequiredFields),
            (3, ErrorKind::ValidationError),
        ]
    );
    assert_eq!(t.employee_ids().await, vec![1, 5]);
}

#[tokio::test]
async fn test_unresolved_foreign_key_is_logged_with_record() {
    let t = TestEngine::new();
    t.seed_reference_tables().await;

    t.engine
        .submit_batch(
            Table::HiredEmployees,
            vec![employee(Some(7), "Lidia Mendez", 42, 1)],
        )
        .await
        .unwrap();

    let entries = t
        .engine
        .log()
        .query(&LogQuery {
            table: Some(Table::HiredEmployees),
            kind: Some(ErrorKind::ForeignKeyUnresolved),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record_id, Some(7));
    assert!(entries[0].message.contains("42"));
    assert_eq!(entries[0].raw_data.as_ref().unwrap()["department_id"], 42);
    assert!(t.employee_ids().await.is_empty());
}

#[tokio::test]
async fn test_full_batch_is_accepted() {
    let t = TestEngine::new();
    let records = (1..=1000).map(|i| job(i, "Data Engineer")).collect();

    let report = t.engine.submit_batch(Table::Jobs, records).await.unwrap();

    assert_eq!(report.success_count, 1000);
    assert_eq!(report.error_count, 0);
    assert_eq!(t.repo.rows(Table::Jobs).await.len(), 1000);
}

#[tokio::test]
async fn test_existing_identifier_is_rejected_online() {
    let t = TestEngine::new();
    t.engine
        .submit_batch(Table::Departments, vec![department(1, "Sales")])
        .await
        .unwrap();

    let report = t
        .engine
        .submit_batch(
            Table::Departments,
            vec![department(1, "Marketing"), department(2, "Marketing")],
        )
        .await
        .unwrap();

    assert_eq!(report.success_count, 1);
    assert_eq!(report.errors[0].kind, ErrorKind::DuplicateIdentifier);
}

#[tokio::test]
async fn test_failing_log_sink_degrades_but_operations_succeed() {
    let t = TestEngine::new();
    t.sink.set_failing(true);

    let report = t
        .engine
        .submit_batch(Table::Jobs, vec![job(1, "Recruiter"), job(2, "R2")])
        .await
        .unwrap();

    assert_eq!(report.success_count, 1);
    assert_eq!(report.error_count, 1);
    assert!(t.engine.log().is_degraded());
    assert!(t.sink.entries().await.is_empty());
}

// ============================================================================
// Historical migrations
// ============================================================================

#[tokio::test]
async fn test_repeated_migrations_converge() {
    let t = TestEngine::new();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 1..=2500 {
        writeln!(file, "{},Department Number", i).unwrap();
    }
    writeln!(file, "2501,").unwrap();

    let first = t.engine.migrate_table(Table::Departments, file.path()).await.unwrap();
    let after_first = t.repo.rows(Table::Departments).await;
    let second = t.engine.migrate_table(Table::Departments, file.path()).await.unwrap();
    let after_second = t.repo.rows(Table::Departments).await;

    assert_eq!(first.records_read, 2501);
    assert_eq!(first.batches, 3);
    assert_eq!(first.records_rejected, 1);
    assert_eq!(first.load.rows_loaded, 2500);
    assert_eq!(first.load.units, 3);
    assert_eq!(second.load.rows_loaded, 2500);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_migrate_all_in_dependency_order() {
    let t = TestEngine::new();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("departments.csv"), "1,Supply Chain\n2,Maintenance\n").unwrap();
    std::fs::write(dir.path().join("jobs.csv"), "1,Recruiter\n2,Manager\n").unwrap();
    std::fs::write(
        dir.path().join("hired_employees.csv"),
        "id,name,datetime,department_id,job_id\n\
         1,Harold Vogt,2021-11-07T02:48:42Z,2,1\n\
         2,Ty Hofer,2021-05-30T05:43:46Z,1,2\n\
         3,Lyman Hadye,2021-09-01T23:27:38Z,5,2\n",
    )
    .unwrap();

    let outcomes = t.engine.migrate_all(Some(dir.path())).await.unwrap();

    let migrated: Vec<_> = outcomes
        .iter()
        .map(|o| match o {
            TableOutcome::Migrated(r) => (r.table, r.load.rows_loaded),
            TableOutcome::Skipped { table, .. } => (*table, 0),
        })
        .collect();
    assert_eq!(
        migrated,
        vec![
            (Table::Departments, 2),
            (Table::Jobs, 2),
            (Table::HiredEmployees, 2),
        ]
    );
    assert_eq!(t.employee_ids().await, vec![1, 2]);
}

// ============================================================================
// Backup and restore
// ============================================================================

#[tokio::test]
async fn test_backup_restore_round_trip_resumes_identity() {
    let t = TestEngine::new();
    t.seed_reference_tables().await;
    t.engine
        .submit_batch(
            Table::HiredEmployees,
            vec![
                employee(Some(10), "Harold Vogt", 1, 1),
                employee(None, "Ty Hofer", 2, 2),
                employee(Some(20), "Lyman Hadye", 3, 3),
                employee(None, "Lidia Mendez", 1, 3),
            ],
        )
        .await
        .unwrap();
    let original = t.repo.rows(Table::HiredEmployees).await;
    assert_eq!(t.employee_ids().await, vec![1, 2, 10, 20]);

    let backup = t.engine.backup(Table::HiredEmployees).await.unwrap();
    assert_eq!(backup.manifest.row_count, 4);
    assert_eq!(backup.manifest.max_id, Some(20));

    // Writes after the backup are discarded by the restore
    t.engine
        .submit_batch(Table::HiredEmployees, vec![employee(None, "Late Hire", 1, 1)])
        .await
        .unwrap();

    let report = t.engine.restore(Table::HiredEmployees, None, None).await.unwrap();
    assert_eq!(report.rows_restored, 4);
    assert_eq!(report.chunks_failed, 0);
    assert_eq!(report.next_identity, Some(21));
    assert_eq!(t.repo.rows(Table::HiredEmployees).await, original);

    t.engine
        .submit_batch(Table::HiredEmployees, vec![employee(None, "Next Hire", 1, 1)])
        .await
        .unwrap();
    assert_eq!(t.employee_ids().await, vec![1, 2, 10, 20, 21]);
}

#[tokio::test]
async fn test_restore_without_path_uses_latest_manifest() {
    let t = TestEngine::new();
    t.engine
        .submit_batch(Table::Jobs, vec![job(1, "Recruiter")])
        .await
        .unwrap();
    t.engine.backup(Table::Jobs).await.unwrap();
    t.engine
        .submit_batch(Table::Jobs, vec![job(2, "Manager")])
        .await
        .unwrap();
    let latest = t.engine.backup(Table::Jobs).await.unwrap();

    let listed = t.engine.list_backups(Table::Jobs).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].backup_path, latest.manifest.backup_path);

    let report = t.engine.restore(Table::Jobs, None, Some(1)).await.unwrap();
    assert_eq!(report.backup_path, latest.manifest.backup_path);
    assert_eq!(report.rows_restored, 2);
}

#[tokio::test]
async fn test_concurrent_backups_get_distinct_paths() {
    let t = TestEngine::new();
    let records = (1..=50).map(|i| job(i, "Analyst")).collect();
    t.engine.submit_batch(Table::Jobs, records).await.unwrap();

    let (first, second) = tokio::join!(
        t.engine.backup(Table::Jobs),
        t.engine.backup(Table::Jobs)
    );
    let first = first.unwrap().manifest;
    let second = second.unwrap().manifest;
    assert_ne!(first.backup_path, second.backup_path);

    for manifest in [&first, &second] {
        let report = t
            .engine
            .restore(Table::Jobs, Some(&manifest.backup_path), None)
            .await
            .unwrap();
        assert_eq!(report.rows_restored, 50);
        assert_eq!(t.repo.rows(Table::Jobs).await.len(), 50);
    }
}

#[tokio::test]
async fn test_tables_back_up_independently() {
    let t = TestEngine::new();
    t.seed_reference_tables().await;

    let (departments, jobs) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            t.engine.backup(Table::Departments),
            t.engine.backup(Table::Jobs)
        )
    })
    .await
    .unwrap();

    assert_eq!(departments.unwrap().manifest.row_count, 3);
    assert_eq!(jobs.unwrap().manifest.row_count, 3);
}

#[tokio::test]
async fn test_restore_without_backups() {
    let t = TestEngine::new();
    let err = t.engine.restore(Table::Jobs, None, None).await.unwrap_err();
    assert!(err.to_string().contains("No backup found"));

    let summary = t.engine.log().summary(None).await.unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].kind, ErrorKind::NoBackupFound);
}
