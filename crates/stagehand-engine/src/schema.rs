//! Schema registry and the record/row types that flow through the engine
//!
//! Every table has a static [`TableSchema`]. The identifier is the first
//! field of every schema; code that works on typed [`Row`]s relies on that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{EngineError, EngineResult};

/// Largest batch accepted by the validator
pub const MAX_BATCH_SIZE: usize = 1000;

/// Shortest and longest accepted name, counted in characters after trimming
pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Departments,
    Jobs,
    HiredEmployees,
}

impl Table {
    /// All tables in dependency order: referenced tables come first
    pub const ALL: [Table; 3] = [Table::Departments, Table::Jobs, Table::HiredEmployees];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Departments => "departments",
            Self::Jobs => "jobs",
            Self::HiredEmployees => "hired_employees",
        }
    }

    pub fn schema(&self) -> &'static TableSchema {
        TableSchema::for_table(*self)
    }

    /// Key for `pg_advisory_xact_lock`, stable across processes
    pub fn lock_key(&self) -> i64 {
        match self {
            Self::Departments => 0x5354_4748_0001,
            Self::Jobs => 0x5354_4748_0002,
            Self::HiredEmployees => 0x5354_4748_0003,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "departments" => Ok(Self::Departments),
            "jobs" => Ok(Self::Jobs),
            "hired_employees" => Ok(Self::HiredEmployees),
            _ => Err(EngineError::UnknownTable(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Text,
    Timestamp,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// Value rules beyond type and presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Positive 32-bit integer, unique within the table
    Identifier,
    /// Letters and spaces only, `NAME_MIN_LEN..=NAME_MAX_LEN` characters after trimming
    Name,
    /// Not later than processing time
    NotInFuture,
    /// Must exist in the referenced table
    References(Table),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub constraints: &'static [Constraint],
}

impl FieldDef {
    pub fn references(&self) -> Option<Table> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::References(table) => Some(*table),
            _ => None,
        })
    }

    pub fn has(&self, constraint: Constraint) -> bool {
        self.constraints.contains(&constraint)
    }
}

#[derive(Debug)]
pub struct TableSchema {
    pub table: Table,
    pub fields: &'static [FieldDef],
    /// The identifier is server-generated when a record omits it
    pub identity: bool,
}

const fn field(
    name: &'static str,
    field_type: FieldType,
    required: bool,
    constraints: &'static [Constraint],
) -> FieldDef {
    FieldDef {
        name,
        field_type,
        required,
        constraints,
    }
}

static DEPARTMENTS: TableSchema = TableSchema {
    table: Table::Departments,
    fields: &[
        field("id", FieldType::Integer, true, &[Constraint::Identifier]),
        field("name", FieldType::Text, true, &[Constraint::Name]),
    ],
    identity: false,
};

static JOBS: TableSchema = TableSchema {
    table: Table::Jobs,
    fields: &[
        field("id", FieldType::Integer, true, &[Constraint::Identifier]),
        field("name", FieldType::Text, true, &[Constraint::Name]),
    ],
    identity: false,
};

static HIRED_EMPLOYEES: TableSchema = TableSchema {
    table: Table::HiredEmployees,
    fields: &[
        field("id", FieldType::Integer, false, &[Constraint::Identifier]),
        field("name", FieldType::Text, true, &[Constraint::Name]),
        field("datetime", FieldType::Timestamp, true, &[Constraint::NotInFuture]),
        field(
            "department_id",
            FieldType::Integer,
            true,
            &[Constraint::References(Table::Departments)],
        ),
        field(
            "job_id",
            FieldType::Integer,
            true,
            &[Constraint::References(Table::Jobs)],
        ),
    ],
    identity: true,
};

impl TableSchema {
    pub fn for_table(table: Table) -> &'static TableSchema {
        match table {
            Table::Departments => &DEPARTMENTS,
            Table::Jobs => &JOBS,
            Table::HiredEmployees => &HIRED_EMPLOYEES,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn identity_field(&self) -> &'static FieldDef {
        &self.fields[0]
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = (&'static FieldDef, Table)> + '_ {
        self.fields
            .iter()
            .filter_map(|f| f.references().map(|table| (f, table)))
    }
}

/// A typed column value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Int(i32),
    Text(String),
    Timestamp(DateTime<Utc>),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Int(v) => JsonValue::from(*v),
            Value::Text(s) => JsonValue::from(s.clone()),
            Value::Timestamp(ts) => {
                JsonValue::from(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            },
            Value::Null => JsonValue::Null,
        }
    }
}

/// Typed values in schema field order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// The identifier, or `None` when the server is to assign it
    pub fn id(&self) -> Option<i32> {
        self.values.first().and_then(Value::as_int)
    }

    pub fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    /// Rebuild the untyped form, used as raw payload in log entries
    pub fn to_record(&self, schema: &TableSchema) -> Record {
        let mut map = Map::new();
        for (field, value) in schema.fields.iter().zip(&self.values) {
            map.insert(field.name.to_string(), value.to_json());
        }
        Record(map)
    }
}

/// One untyped input row: field name to JSON value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, JsonValue>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Best-effort identifier for log entries
    pub fn record_id(&self) -> Option<i64> {
        match self.0.get("id")? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }
}

impl From<Map<String, JsonValue>> for Record {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// An ordered group of 1 to [`MAX_BATCH_SIZE`] records
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> EngineResult<Self> {
        if records.is_empty() {
            return Err(EngineError::InvalidBatch("batch is empty".to_string()));
        }
        if records.len() > MAX_BATCH_SIZE {
            return Err(EngineError::InvalidBatch(format!(
                "batch has {} records, the maximum is {}",
                records.len(),
                MAX_BATCH_SIZE
            )));
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}
