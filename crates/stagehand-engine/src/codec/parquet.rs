use arrow::array::{
    Array, ArrayRef, AsArray, Int32Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Int32Type, Schema, SchemaRef, TimeUnit, TimestampMicrosecondType};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::DateTime;
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::schema::{FieldDef, FieldType, Row, TableSchema, Value};

pub const FORMAT_TAG: &str = "parquet";
pub const COMPRESSION_TAG: &str = "snappy";

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Integer => DataType::Int32,
        FieldType::Text => DataType::Utf8,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

pub fn arrow_schema(schema: &TableSchema) -> SchemaRef {
    Arc::new(Schema::new(
        schema
            .fields
            .iter()
            .map(|f| Field::new(f.name, arrow_type(f.field_type), !f.required))
            .collect::<Vec<_>>(),
    ))
}

fn build_column(index: usize, field: &FieldDef, rows: &[Row]) -> ArrayRef {
    match field.field_type {
        FieldType::Integer => Arc::new(Int32Array::from(
            rows.iter().map(|r| r.get(index).as_int()).collect::<Vec<_>>(),
        )),
        FieldType::Text => Arc::new(StringArray::from(
            rows.iter()
                .map(|r| match r.get(index) {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        FieldType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                rows.iter()
                    .map(|r| match r.get(index) {
                        Value::Timestamp(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    }
}

/// Encode one chunk as a Snappy-compressed Parquet file
pub fn encode_parquet(schema: &TableSchema, rows: &[Row]) -> EngineResult<Vec<u8>> {
    let arrow_schema = arrow_schema(schema);
    let columns = schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| build_column(i, f, rows))
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(arrow_schema.clone(), columns)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(buffer)
}

/// Decode a Parquet chunk. Columns are looked up by name, so files written
/// with extra or reordered columns still load.
pub fn decode_parquet(schema: &TableSchema, data: Bytes) -> EngineResult<Vec<Row>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?.build()?;
    let mut rows = Vec::new();

    for batch in reader {
        let batch = batch?;
        let start = rows.len();
        rows.extend((0..batch.num_rows()).map(|_| Row::new(Vec::with_capacity(schema.fields.len()))));

        for field in schema.fields {
            let column = batch.column_by_name(field.name);
            for (offset, row) in rows[start..].iter_mut().enumerate() {
                let value = match column {
                    Some(col) => read_value(field, col.as_ref(), offset)?,
                    None if field.required => {
                        return Err(ArrowError::SchemaError(format!(
                            "required column '{}' missing from chunk",
                            field.name
                        ))
                        .into())
                    },
                    None => Value::Null,
                };
                row.values.push(value);
            }
        }
    }

    Ok(rows)
}

fn read_value(field: &FieldDef, column: &dyn Array, offset: usize) -> Result<Value, ArrowError> {
    if column.is_null(offset) {
        return Ok(Value::Null);
    }
    let mismatch = || {
        ArrowError::SchemaError(format!(
            "column '{}' has type {}, expected {}",
            field.name,
            column.data_type(),
            arrow_type(field.field_type)
        ))
    };

    match field.field_type {
        FieldType::Integer => column
            .as_primitive_opt::<Int32Type>()
            .map(|a| Value::Int(a.value(offset)))
            .ok_or_else(mismatch),
        FieldType::Text => column
            .as_string_opt::<i32>()
            .map(|a| Value::Text(a.value(offset).to_string()))
            .ok_or_else(mismatch),
        FieldType::Timestamp => {
            let micros = column
                .as_primitive_opt::<TimestampMicrosecondType>()
                .map(|a| a.value(offset))
                .ok_or_else(mismatch)?;
            DateTime::from_timestamp_micros(micros)
                .map(Value::Timestamp)
                .ok_or_else(|| {
                    ArrowError::InvalidArgumentError(format!(
                        "column '{}' timestamp {} out of range",
                        field.name, micros
                    ))
                })
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Table;
    use chrono::{TimeZone, Utc};

    fn employees(n: i32) -> Vec<Row> {
        (1..=n)
            .map(|i| {
                Row::new(vec![
                    Value::Int(i),
                    Value::Text(format!("Employee {}", i)),
                    Value::Timestamp(Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap()),
                    Value::Int(i % 5 + 1),
                    Value::Int(i % 7 + 1),
                ])
            })
            .collect()
    }

    #[test]
    fn test_parquet_preserves_rows_and_order() {
        let schema = Table::HiredEmployees.schema();
        let rows = employees(250);
        let bytes = encode_parquet(schema, &rows).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");

        let decoded = decode_parquet(schema, Bytes::from(bytes)).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_parquet_uses_snappy() {
        let schema = Table::Jobs.schema();
        let rows = vec![Row::new(vec![Value::Int(1), Value::Text("Engineer".into())])];
        let bytes = Bytes::from(encode_parquet(schema, &rows).unwrap());

        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).unwrap();
        let column = builder.metadata().row_group(0).column(0);
        assert_eq!(column.compression(), Compression::SNAPPY);
    }

    #[test]
    fn test_decode_rejects_wrong_column_type() {
        let jobs = Table::Jobs.schema();
        let rows = vec![Row::new(vec![Value::Int(1), Value::Text("Engineer".into())])];
        let bytes = Bytes::from(encode_parquet(jobs, &rows).unwrap());

        // a jobs chunk has no datetime column, which hired_employees requires
        assert!(decode_parquet(Table::HiredEmployees.schema(), bytes).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let schema = Table::Jobs.schema();
        assert!(decode_parquet(schema, Bytes::from_static(b"not parquet")).is_err());
    }
}
