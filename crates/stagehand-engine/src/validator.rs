//! Batch validation against the schema registry
//!
//! Every record gets exactly one [`ValidationResult`], in input order.
//! Rejected records are written to the migration log before the results are
//! returned, followed by one `BATCH_SUMMARY` entry for the batch. Rejections
//! are values: validation only fails when the reference snapshot or the
//! existing-identifier lookup cannot be read.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::codec::parse_datetime;
use crate::db::{ReferenceSnapshot, Repository};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::migration_log::{MigrationLog, MigrationLogEntry};
use crate::schema::{
    Batch, Constraint, FieldDef, FieldType, Record, Row, Table, TableSchema, Value, NAME_MAX_LEN,
    NAME_MIN_LEN,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Position of the record in its batch
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
    pub record: Record,
}

impl Rejection {
    pub fn to_log_entry(&self, table: Table) -> MigrationLogEntry {
        MigrationLogEntry::new(table, self.kind, self.message.clone())
            .with_record_id(self.record.record_id())
            .with_raw(self.record.to_json())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid { index: usize, row: Row },
    Invalid(Rejection),
}

impl ValidationResult {
    pub fn index(&self) -> usize {
        match self {
            Self::Valid { index, .. } => *index,
            Self::Invalid(rejection) => rejection.index,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Split results into accepted rows and rejections, both in input order
pub fn partition(results: Vec<ValidationResult>) -> (Vec<Row>, Vec<Rejection>) {
    let mut rows = Vec::new();
    let mut rejections = Vec::new();
    for result in results {
        match result {
            ValidationResult::Valid { row, .. } => rows.push(row),
            ValidationResult::Invalid(rejection) => rejections.push(rejection),
        }
    }
    (rows, rejections)
}

/// State shared by the batches of one migration: the reference snapshot and
/// the identifiers accepted so far
pub struct ValidationRun {
    table: Table,
    snapshot: ReferenceSnapshot,
    seen_ids: HashSet<i32>,
    /// Reject identifiers already present in the target table
    check_existing: bool,
    batches: usize,
    fixed_now: Option<DateTime<Utc>>,
}

impl ValidationRun {
    pub fn table(&self) -> Table {
        self.table
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Pin "processing time" for the future-date rule
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }
}

pub struct Validator {
    repository: Arc<dyn Repository>,
    log: MigrationLog,
    name_pattern: Regex,
}

impl Validator {
    pub fn new(repository: Arc<dyn Repository>, log: MigrationLog) -> EngineResult<Self> {
        let name_pattern = Regex::new(r"^[\p{L}\s]+$")
            .map_err(|e| EngineError::config(format!("name pattern: {}", e)))?;
        Ok(Self {
            repository,
            log,
            name_pattern,
        })
    }

    /// Start a run. The reference snapshot is taken once, here.
    pub async fn begin_run(&self, table: Table, check_existing: bool) -> EngineResult<ValidationRun> {
        let snapshot = if table.schema().foreign_keys().next().is_some() {
            self.repository.reference_snapshot().await?
        } else {
            ReferenceSnapshot::default()
        };
        Ok(ValidationRun {
            table,
            snapshot,
            seen_ids: HashSet::new(),
            check_existing,
            batches: 0,
            fixed_now: None,
        })
    }

    /// Validate one online batch: a single-batch run that also rejects
    /// identifiers already present in the table
    pub async fn validate(&self, table: Table, batch: &Batch) -> EngineResult<Vec<ValidationResult>> {
        let mut run = self.begin_run(table, true).await?;
        self.validate_batch(&mut run, batch).await
    }

    #[instrument(skip(self, run, batch), fields(table = %run.table, records = batch.len()))]
    pub async fn validate_batch(
        &self,
        run: &mut ValidationRun,
        batch: &Batch,
    ) -> EngineResult<Vec<ValidationResult>> {
        let schema = run.table.schema();
        run.batches += 1;

        let existing = if run.check_existing {
            let ids: Vec<i32> = batch
                .records()
                .iter()
                .filter_map(|r| r.record_id())
                .filter_map(|id| i32::try_from(id).ok())
                .collect();
            self.repository.existing_ids(run.table, &ids).await?
        } else {
            HashSet::new()
        };

        let now = run.now();
        let mut results = Vec::with_capacity(batch.len());
        for (index, record) in batch.records().iter().enumerate() {
            let checked = self.check_record(schema, record, &run.snapshot, &run.seen_ids, &existing, now);
            match checked {
                Ok(row) => {
                    if let Some(id) = row.id() {
                        run.seen_ids.insert(id);
                    }
                    results.push(ValidationResult::Valid { index, row });
                },
                Err((kind, message)) => results.push(ValidationResult::Invalid(Rejection {
                    index,
                    kind,
                    message,
                    record: record.clone(),
                })),
            }
        }

        self.log_batch(run, &results).await;
        Ok(results)
    }

    async fn log_batch(&self, run: &ValidationRun, results: &[ValidationResult]) {
        let mut by_kind: BTreeMap<&'static str, u64> = BTreeMap::new();
        let mut entries = Vec::new();
        for result in results {
            if let ValidationResult::Invalid(rejection) = result {
                *by_kind.entry(rejection.kind.as_str()).or_default() += 1;
                entries.push(rejection.to_log_entry(run.table));
            }
        }

        let valid = results.iter().filter(|r| r.is_valid()).count();
        let rejected = results.len() - valid;
        debug!(batch = run.batches, valid, rejected, "Batch validated");

        entries.push(
            MigrationLogEntry::new(
                run.table,
                ErrorKind::BatchSummary,
                format!(
                    "batch {}: {} records, {} valid, {} rejected",
                    run.batches,
                    results.len(),
                    valid,
                    rejected
                ),
            )
            .with_raw(json!({
                "batch": run.batches,
                "total": results.len(),
                "valid": valid,
                "rejected": rejected,
                "by_kind": by_kind,
            })),
        );

        self.log.record_all(entries).await;
    }

    fn check_record(
        &self,
        schema: &TableSchema,
        record: &Record,
        snapshot: &ReferenceSnapshot,
        seen: &HashSet<i32>,
        existing: &HashSet<i32>,
        now: DateTime<Utc>,
    ) -> Result<Row, (ErrorKind, String)> {
        let missing: Vec<&str> = schema
            .fields
            .iter()
            .filter(|f| f.required && is_blank(record.get(f.name)))
            .map(|f| f.name)
            .collect();
        if !missing.is_empty() {
            return Err((
                ErrorKind::MissingRequiredFields,
                format!("missing required fields: {}", missing.join(", ")),
            ));
        }

        let mut violations: Vec<(ErrorKind, String)> = Vec::new();
        let mut values = Vec::with_capacity(schema.fields.len());

        for field in schema.fields {
            let raw = record.get(field.name);
            if is_blank(raw) {
                values.push(Value::Null);
                continue;
            }
            let raw = raw.unwrap_or(&JsonValue::Null);
            match self.check_field(schema, field, raw, snapshot, seen, existing, now) {
                Ok(value) => values.push(value),
                Err(violation) => {
                    violations.push(violation);
                    values.push(Value::Null);
                },
            }
        }

        if violations.is_empty() {
            return Ok(Row::new(values));
        }
        let kind = violations[0].0;
        let message = violations
            .into_iter()
            .map(|(_, m)| m)
            .collect::<Vec<_>>()
            .join("; ");
        Err((kind, message))
    }

    #[allow(clippy::too_many_arguments)]
    fn check_field(
        &self,
        schema: &TableSchema,
        field: &FieldDef,
        raw: &JsonValue,
        snapshot: &ReferenceSnapshot,
        seen: &HashSet<i32>,
        existing: &HashSet<i32>,
        now: DateTime<Utc>,
    ) -> Result<Value, (ErrorKind, String)> {
        let invalid = |message: String| (ErrorKind::ValidationError, message);

        match field.field_type {
            FieldType::Integer => {
                let number = integer(raw)
                    .ok_or_else(|| invalid(format!("{}: {} is not an integer", field.name, raw)))?;
                let value = i32::try_from(number)
                    .ok()
                    .filter(|v| !field.has(Constraint::Identifier) || *v >= 1)
                    .ok_or_else(|| {
                        invalid(format!(
                            "{}: {} is outside 1..={}",
                            field.name,
                            number,
                            i32::MAX
                        ))
                    })?;

                if field.has(Constraint::Identifier) {
                    if existing.contains(&value) {
                        return Err((
                            ErrorKind::DuplicateIdentifier,
                            format!("{}: {} already exists in {}", field.name, value, schema.table),
                        ));
                    }
                    if seen.contains(&value) {
                        return Err((
                            ErrorKind::DuplicateIdentifier,
                            format!("{}: {} appears more than once in this load", field.name, value),
                        ));
                    }
                }

                if let Some(referenced) = field.references() {
                    if !snapshot.contains(referenced, value) {
                        return Err((
                            ErrorKind::ForeignKeyUnresolved,
                            format!("{}: {} {} does not exist", field.name, referenced, value),
                        ));
                    }
                }

                Ok(Value::Int(value))
            },
            FieldType::Text => {
                let text = match raw {
                    JsonValue::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                };
                let len = text.chars().count();
                if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
                    return Err(invalid(format!(
                        "{}: length {} is outside {}..={}",
                        field.name, len, NAME_MIN_LEN, NAME_MAX_LEN
                    )));
                }
                if field.has(Constraint::Name) && !self.name_pattern.is_match(&text) {
                    return Err(invalid(format!(
                        "{}: '{}' must contain only letters and spaces",
                        field.name, text
                    )));
                }
                Ok(Value::Text(text))
            },
            FieldType::Timestamp => {
                let ts = raw
                    .as_str()
                    .and_then(parse_datetime)
                    .ok_or_else(|| invalid(format!("{}: {} is not a valid date-time", field.name, raw)))?;
                if field.has(Constraint::NotInFuture) && ts > now {
                    return Err(invalid(format!(
                        "{}: {} is in the future",
                        field.name,
                        ts.to_rfc3339()
                    )));
                }
                Ok(Value::Timestamp(ts))
            },
        }
    }
}

fn is_blank(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// Integers arrive as JSON numbers or, from CSV, as numeric strings
fn integer(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 1e15).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
