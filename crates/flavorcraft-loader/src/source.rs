//! Streaming CSV source reader
//!
//! Reads a delimited file in fixed-size batches. Each batch is columnar and
//! carries a per-column storage type inferred from that batch alone, the same
//! way a dataframe reader types a chunk: whole numbers become integer storage,
//! anything else numeric becomes float storage, the rest stays text.

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use flavorcraft_common::Result;
use std::path::{Path, PathBuf};
use tokio::fs::File;

/// Field values read as missing before any type inference happens.
pub const NATIVE_MISSING_TOKENS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NULL", "null", "None", "<NA>", "#N/A", "nan", "NaN", "-nan", "-NaN",
];

/// Returns true if a raw field is one of the native missing-value markers.
pub fn is_native_missing(field: &str) -> bool {
    NATIVE_MISSING_TOKENS.contains(&field)
}

/// A single source cell, typed by its column's storage.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Missing,
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Storage type of one column within one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStorage {
    Integer,
    Float,
    Text,
    /// Every value in the batch was missing
    Empty,
}

/// One column of a source batch
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub name: String,
    pub storage: ColumnStorage,
    pub values: Vec<RawValue>,
}

impl SourceColumn {
    /// Build a column from raw text fields, inferring its storage.
    pub fn from_fields<S: AsRef<str>>(name: impl Into<String>, fields: &[S]) -> Self {
        let present: Vec<&str> = fields
            .iter()
            .map(AsRef::as_ref)
            .filter(|f| !is_native_missing(f))
            .collect();

        let storage = if present.is_empty() {
            ColumnStorage::Empty
        } else if present.iter().all(|f| f.parse::<i64>().is_ok()) {
            ColumnStorage::Integer
        } else if present.iter().all(|f| f.parse::<f64>().is_ok()) {
            ColumnStorage::Float
        } else {
            ColumnStorage::Text
        };

        let values = fields
            .iter()
            .map(|field| {
                let field = field.as_ref();
                if is_native_missing(field) {
                    return RawValue::Missing;
                }
                match storage {
                    ColumnStorage::Integer => field
                        .parse()
                        .map(RawValue::Integer)
                        .unwrap_or(RawValue::Missing),
                    ColumnStorage::Float => field
                        .parse()
                        .map(RawValue::Float)
                        .unwrap_or(RawValue::Missing),
                    ColumnStorage::Text => RawValue::Text(field.to_string()),
                    ColumnStorage::Empty => RawValue::Missing,
                }
            })
            .collect();

        Self {
            name: name.into(),
            storage,
            values,
        }
    }

    /// Build a column from already-typed values.
    pub fn typed(name: impl Into<String>, storage: ColumnStorage, values: Vec<RawValue>) -> Self {
        Self {
            name: name.into(),
            storage,
            values,
        }
    }
}

/// An ordered slice of source rows, stored column by column
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    /// 1-based position of this batch within its file
    pub index: usize,
    pub columns: Vec<SourceColumn>,
    row_count: usize,
}

impl SourceBatch {
    pub fn new(index: usize, columns: Vec<SourceColumn>) -> Self {
        let row_count = columns.first().map_or(0, |c| c.values.len());
        Self {
            index,
            columns,
            row_count,
        }
    }

    /// Transpose row-major text records into a typed columnar batch.
    pub fn from_records(index: usize, headers: &[String], records: &[Vec<String>]) -> Self {
        let columns = headers
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let fields: Vec<&str> = records
                    .iter()
                    .map(|r| r.get(col).map(String::as_str).unwrap_or(""))
                    .collect();
                SourceColumn::from_fields(name.clone(), &fields)
            })
            .collect();

        Self {
            index,
            columns,
            row_count: records.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&SourceColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Streams a CSV file batch by batch.
///
/// Rows with a field count different from the header fail the read, which
/// callers treat as a file-level error.
pub struct SourceReader {
    path: PathBuf,
    reader: AsyncReader<File>,
    headers: Vec<String>,
    batches_read: usize,
    record: StringRecord,
}

impl SourceReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .create_reader(file);

        let headers = reader
            .headers()
            .await?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        Ok(Self {
            path,
            reader,
            headers,
            batches_read: 0,
            record: StringRecord::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Read up to `batch_size` rows. Returns `None` once the file is exhausted.
    pub async fn next_batch(&mut self, batch_size: usize) -> Result<Option<SourceBatch>> {
        let mut records = Vec::with_capacity(batch_size);

        while records.len() < batch_size {
            if !self.reader.read_record(&mut self.record).await? {
                break;
            }
            records.push(self.record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        if records.is_empty() {
            return Ok(None);
        }

        self.batches_read += 1;
        Ok(Some(SourceBatch::from_records(
            self.batches_read,
            &self.headers,
            &records,
        )))
    }
}
