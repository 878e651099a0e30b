//! Staging path layout
//!
//! ```text
//! {table}/{ts}/part-0000.parquet
//! {table}/{ts}/manifest.json
//! {table}/raw/{ts}.csv
//! ```
//!
//! `ts` is `YYYYMMDDTHHMMSS.ffffffZ` in UTC. Keys are strictly increasing
//! within a process, so lexicographic order is creation order.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::schema::Table;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RAW_DIR: &str = "raw";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current time, bumped forward by a microsecond if the clock has not
/// advanced since the previous call
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

pub fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp_key(key: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Directory of one backup, with trailing slash
pub fn backup_dir(table: Table, ts: DateTime<Utc>) -> String {
    format!("{}/{}/", table, timestamp_key(ts))
}

pub fn chunk_path(backup_dir: &str, index: usize) -> String {
    format!("{}{}", backup_dir, chunk_file(index))
}

pub fn chunk_file(index: usize) -> String {
    format!("part-{:04}.parquet", index)
}

pub fn manifest_path(backup_dir: &str) -> String {
    format!("{}{}", backup_dir, MANIFEST_FILE)
}

pub fn raw_stage_path(table: Table, ts: DateTime<Utc>) -> String {
    format!("{}/{}/{}.csv", table, RAW_DIR, timestamp_key(ts))
}

/// Prefix under which all backups of a table live
pub fn table_prefix(table: Table) -> String {
    format!("{}/", table)
}

/// Accepts `{table}/{ts}`, `{table}/{ts}/`, `{table}/{ts}/manifest.json`
/// and `s3://bucket/{table}/{ts}/`, returning the directory form with a
/// trailing slash.
pub fn normalize_backup_dir(input: &str) -> String {
    let mut path = input.trim();
    if let Some(rest) = path.strip_prefix("s3://") {
        path = rest.split_once('/').map(|(_, key)| key).unwrap_or("");
    }
    let path = path.trim_start_matches('/');
    let path = path.strip_suffix(MANIFEST_FILE).unwrap_or(path);
    let path = path.trim_end_matches('/');
    format!("{}/", path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedFormat {
    RawCsv,
    ParquetChunk,
    Manifest,
}

/// An object in the staging store, recognised from its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedObject {
    pub path: String,
    pub format: StagedFormat,
    pub table: Table,
    pub created_at: DateTime<Utc>,
}

impl StagedObject {
    /// `None` for paths outside the staging layout
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.split('/');
        let table: Table = parts.next()?.parse().ok()?;
        let dir = parts.next()?;
        let file = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let (format, key) = if dir == RAW_DIR {
            (StagedFormat::RawCsv, file.strip_suffix(".csv")?)
        } else if file == MANIFEST_FILE {
            (StagedFormat::Manifest, dir)
        } else if file.starts_with("part-") && file.ends_with(".parquet") {
            (StagedFormat::ParquetChunk, dir)
        } else {
            return None;
        };

        Some(Self {
            path: path.to_string(),
            format,
            table,
            created_at: parse_timestamp_key(key)?,
        })
    }
}

/// Whether `path` is a backup manifest directly under `{table}/{ts}/`
pub fn is_backup_manifest(table: Table, path: &str) -> bool {
    StagedObject::parse(path)
        .is_some_and(|object| object.table == table && object.format == StagedFormat::Manifest)
}
