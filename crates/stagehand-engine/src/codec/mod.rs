//! Conversions between typed rows and their external encodings
//!
//! - [`csv`]: staged CSV files and the PostgreSQL `COPY` text format
//! - [`parquet`]: Snappy-compressed Parquet chunks for backups

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::schema::{FieldDef, FieldType, Value};

pub mod csv;
pub mod parquet;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a combined date-time. RFC 3339 values keep their offset; values
/// without one are taken as UTC.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse the textual form of a field; the empty string is NULL
pub fn parse_value(field: &FieldDef, input: &str) -> Result<Value, String> {
    if input.is_empty() {
        return Ok(Value::Null);
    }
    match field.field_type {
        FieldType::Integer => input
            .trim()
            .parse::<i32>()
            .map(Value::Int)
            .map_err(|_| format!("{}: '{}' is not a 32-bit integer", field.name, input)),
        FieldType::Text => Ok(Value::Text(input.to_string())),
        FieldType::Timestamp => parse_datetime(input)
            .map(Value::Timestamp)
            .ok_or_else(|| format!("{}: '{}' is not a date-time", field.name, input)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Table;
    use chrono::TimeZone;

    #[test]
    fn test_parse_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2021, 11, 7, 2, 48, 42).unwrap();
        assert_eq!(parse_datetime("2021-11-07T02:48:42Z"), Some(expected));
        assert_eq!(parse_datetime("2021-11-07T02:48:42"), Some(expected));
        assert_eq!(parse_datetime("2021-11-07 02:48:42"), Some(expected));
        assert_eq!(parse_datetime("2021-11-07T04:48:42+02:00"), Some(expected));
        assert!(parse_datetime("2021-11-07T02:48:42.250Z").is_some());
        assert!(parse_datetime("07/11/2021").is_none());
        assert!(parse_datetime("2021-11-07").is_none());
    }

    #[test]
    fn test_parse_value() {
        let schema = Table::HiredEmployees.schema();
        let id = schema.field("id").unwrap();
        assert_eq!(parse_value(id, "42"), Ok(Value::Int(42)));
        assert_eq!(parse_value(id, ""), Ok(Value::Null));
        assert!(parse_value(id, "4.5").is_err());
        assert!(parse_value(id, "99999999999").is_err());
    }
}
