//! CSV batch source for historical loads
//!
//! Input files may or may not start with a header line. A first line that
//! contains any expected column name is taken as a header and columns are
//! matched by name; otherwise columns follow schema order.

use bytes::Bytes;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::schema::{Batch, Record, Table, MAX_BATCH_SIZE};

pub struct CsvBatchSource {
    table: Table,
    data: Bytes,
}

impl CsvBatchSource {
    pub fn from_bytes(table: Table, data: impl Into<Bytes>) -> Self {
        Self {
            table,
            data: data.into(),
        }
    }

    pub async fn from_path(table: Table, path: impl AsRef<Path>) -> EngineResult<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        Ok(Self::from_bytes(table, data))
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn has_header(&self) -> bool {
        let first_line = self
            .data
            .split(|b| *b == b'\n')
            .next()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let schema = self.table.schema();
        first_line
            .split(',')
            .map(|cell| cell.trim().trim_matches('"').trim().to_lowercase())
            .any(|cell| schema.field(&cell).is_some())
    }

    /// Iterate the file in batches of `size` records. Each call starts again
    /// from the first line.
    pub fn batches(&self, size: usize) -> EngineResult<CsvBatches<'_>> {
        if size == 0 || size > MAX_BATCH_SIZE {
            return Err(EngineError::InvalidBatch(format!(
                "batch size {} is outside 1..={}",
                size, MAX_BATCH_SIZE
            )));
        }

        let has_header = self.has_header();
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(has_header)
            .flexible(true)
            .from_reader(self.data.as_ref());

        let schema = self.table.schema();
        let columns: Vec<Option<&'static str>> = if has_header {
            reader
                .headers()?
                .iter()
                .map(|h| schema.field(&h.trim().to_lowercase()).map(|f| f.name))
                .collect()
        } else {
            schema.fields.iter().map(|f| Some(f.name)).collect()
        };

        Ok(CsvBatches {
            records: reader.into_records(),
            columns,
            size,
        })
    }
}

pub struct CsvBatches<'a> {
    records: ::csv::StringRecordsIntoIter<&'a [u8]>,
    columns: Vec<Option<&'static str>>,
    size: usize,
}

impl CsvBatches<'_> {
    fn to_record(&self, row: &::csv::StringRecord) -> Record {
        let mut record = Record::new();
        for (column, value) in self.columns.iter().zip(row.iter()) {
            if let Some(name) = column {
                record = record.with(name, value);
            }
        }
        record
    }
}

impl Iterator for CsvBatches<'_> {
    type Item = EngineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut records = Vec::with_capacity(self.size);
        while records.len() < self.size {
            match self.records.next() {
                None => break,
                Some(Err(e)) => return Some(Err(e.into())),
                Some(Ok(row)) => records.push(self.to_record(&row)),
            }
        }
        if records.is_empty() {
            None
        } else {
            Some(Batch::new(records))
        }
    }
}
