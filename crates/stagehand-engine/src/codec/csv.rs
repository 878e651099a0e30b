use chrono::SecondsFormat;
use std::fmt::Write as _;

use super::parse_value;
use crate::error::EngineResult;
use crate::schema::{Record, Row, TableSchema, Value};

/// A staged line that could not be turned back into a typed row
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRowError {
    /// 1-based data line, header excluded
    pub line: usize,
    pub raw: Record,
    pub message: String,
}

/// Encode rows as a staged CSV file with a header line in schema order
pub fn encode_staged_csv(schema: &TableSchema, rows: &[Row]) -> EngineResult<Vec<u8>> {
    let mut writer = ::csv::Writer::from_writer(Vec::new());
    writer.write_record(schema.column_names())?;

    for row in rows {
        writer.write_record(row.values.iter().map(staged_field))?;
    }

    writer
        .into_inner()
        .map_err(|e| crate::error::EngineError::Io(e.into_error()))
}

fn staged_field(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        Value::Null => String::new(),
    }
}

/// Decode a staged CSV file. Columns are matched by header name; lines that
/// fail to convert are returned as errors next to the good rows, in input
/// order.
pub fn decode_staged_csv(
    schema: &TableSchema,
    data: &[u8],
) -> EngineResult<Vec<Result<Row, StagedRowError>>> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let positions: Vec<Option<usize>> = schema
        .fields
        .iter()
        .map(|f| headers.iter().position(|h| h == f.name))
        .collect();

    let mut out = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let line = index + 1;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                out.push(Err(StagedRowError {
                    line,
                    raw: Record::new(),
                    message: e.to_string(),
                }));
                continue;
            },
        };

        let mut raw = Record::new();
        for (name, value) in headers.iter().zip(record.iter()) {
            raw = raw.with(name, value);
        }

        let mut values = Vec::with_capacity(schema.fields.len());
        let mut problems = Vec::new();
        for (field, position) in schema.fields.iter().zip(&positions) {
            let text = position.and_then(|p| record.get(p)).unwrap_or("");
            match parse_value(field, text) {
                Ok(value) => values.push(value),
                Err(message) => problems.push(message),
            }
        }

        if problems.is_empty() {
            out.push(Ok(Row::new(values)));
        } else {
            out.push(Err(StagedRowError {
                line,
                raw,
                message: problems.join("; "),
            }));
        }
    }

    Ok(out)
}

/// Encode rows in PostgreSQL `COPY ... FROM STDIN` text format, keeping only
/// the columns at `columns`
pub fn encode_copy_text<'a>(rows: impl IntoIterator<Item = &'a Row>, columns: &[usize]) -> String {
    let mut out = String::new();
    for row in rows {
        for (n, &col) in columns.iter().enumerate() {
            if n > 0 {
                out.push('\t');
            }
            match row.get(col) {
                Value::Null => out.push_str("\\N"),
                Value::Int(v) => {
                    let _ = write!(out, "{}", v);
                },
                Value::Text(s) => push_copy_escaped(&mut out, s),
                Value::Timestamp(ts) => {
                    let _ = write!(out, "{}", ts.format("%Y-%m-%d %H:%M:%S%.6f+00"));
                },
            }
        }
        out.push('\n');
    }
    out
}

fn push_copy_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Table;
    use chrono::{TimeZone, Utc};

    fn employee(id: Option<i32>, name: &str) -> Row {
        Row::new(vec![
            id.map(Value::Int).unwrap_or(Value::Null),
            Value::Text(name.to_string()),
            Value::Timestamp(Utc.with_ymd_and_hms(2021, 7, 27, 16, 2, 8).unwrap()),
            Value::Int(1),
            Value::Int(2),
        ])
    }

    #[test]
    fn test_staged_csv_preserves_rows() {
        let schema = Table::HiredEmployees.schema();
        let rows = vec![employee(Some(1), "Ana, Maria"), employee(None, "Luis \"Lucho\"")];

        let bytes = encode_staged_csv(schema, &rows).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("id,name,datetime,department_id,job_id\n"));

        let decoded: Vec<Row> = decode_staged_csv(schema, &bytes)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_staged_csv_reports_bad_lines_in_place() {
        let schema = Table::Jobs.schema();
        let data = b"id,name\n1,Engineer\nx,Analyst\n3,Manager\n";
        let decoded = decode_staged_csv(schema, data).unwrap();

        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].is_ok());
        let err = decoded[1].as_ref().unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.raw.get("name").and_then(|v| v.as_str()), Some("Analyst"));
        assert!(err.message.contains("id"));
        assert!(decoded[2].is_ok());
    }

    #[test]
    fn test_staged_csv_matches_columns_by_header() {
        let schema = Table::Jobs.schema();
        let decoded = decode_staged_csv(schema, b"name,id\nEngineer,5\n").unwrap();
        assert_eq!(
            decoded[0].as_ref().unwrap(),
            &Row::new(vec![Value::Int(5), Value::Text("Engineer".into())])
        );
    }

    #[test]
    fn test_copy_text_escapes_and_nulls() {
        let rows = vec![Row::new(vec![
            Value::Null,
            Value::Text("tab\there\\".into()),
            Value::Timestamp(Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap()),
        ])];
        let text = encode_copy_text(&rows, &[0, 1, 2]);
        assert_eq!(text, "\\N\ttab\\there\\\\\t2021-01-02 03:04:05.000000+00\n");
    }

    #[test]
    fn test_copy_text_column_subset() {
        let rows = vec![employee(None, "Ana")];
        let text = encode_copy_text(&rows, &[1, 3, 4]);
        assert_eq!(text, "Ana\t1\t2\n");
    }
}
