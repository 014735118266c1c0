//! Row sanitizer
//!
//! Turns a [`SourceBatch`] into rows the database will accept:
//!
//! 1. Designated boolean columns are coerced from their many encodings
//!    (`1`, `"1.0"`, `"t"`, `"True"`, ...) to true/false, anything else to null.
//! 2. Every missing-value spelling (empty, `"nan"`, `"NaN"`, native markers)
//!    becomes an explicit null.
//! 3. Float columns whose non-null values are all whole numbers are re-typed
//!    as integers, so ids that a reader widened to float go back to `BIGINT`
//!    instead of failing with "bigint out of range" or losing digits.
//!
//! All decisions are local to one batch. The same column can come out as
//! integer in one batch and float in the next if the data differs.

use std::collections::HashSet;

use crate::source::{is_native_missing, ColumnStorage, RawValue, SourceBatch, SourceColumn};

/// Tokens coerced to `true` in boolean columns.
pub const TRUE_TOKENS: &[&str] = &["1", "1.0", "True", "true", "t"];

/// Tokens coerced to `false` in boolean columns.
pub const FALSE_TOKENS: &[&str] = &["0", "0.0", "False", "false", "f"];

/// A database-insertable value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text form used as a bind parameter; the statement casts it to the
    /// destination column's type.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Float(v) if v.is_nan() => Some("NaN".to_string()),
            SqlValue::Float(v) if v.is_infinite() => Some(
                if v.is_sign_positive() {
                    "Infinity"
                } else {
                    "-Infinity"
                }
                .to_string(),
            ),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Boolean(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
        }
    }
}

/// Type of a sanitized column for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizedKind {
    Integer,
    Float,
    Boolean,
    Text,
    /// No non-null values in this batch
    Null,
}

/// A batch ready for insertion, row-major, columns in source order
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedBatch {
    pub index: usize,
    pub columns: Vec<String>,
    pub kinds: Vec<SanitizedKind>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl SanitizedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn kind_of(&self, column: &str) -> Option<SanitizedKind> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.kinds[i])
    }

    /// All values of one column, top to bottom.
    pub fn column_values(&self, column: &str) -> Option<Vec<&SqlValue>> {
        let idx = self.columns.iter().position(|c| c == column)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

/// Cleans source batches for insertion
#[derive(Debug, Clone, Default)]
pub struct RowSanitizer {
    boolean_columns: HashSet<String>,
}

impl RowSanitizer {
    pub fn new<I, S>(boolean_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            boolean_columns: boolean_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_boolean_column(&self, column: &str) -> bool {
        self.boolean_columns.contains(column)
    }

    /// Sanitize one batch. Output has the same rows and the same columns in
    /// the same order as the input.
    pub fn sanitize(&self, batch: &SourceBatch) -> SanitizedBatch {
        let mut columns = Vec::with_capacity(batch.columns.len());
        let mut kinds = Vec::with_capacity(batch.columns.len());
        let mut cleaned = Vec::with_capacity(batch.columns.len());

        for column in &batch.columns {
            let (kind, values) = if self.is_boolean_column(&column.name) {
                (
                    SanitizedKind::Boolean,
                    column
                        .values
                        .iter()
                        .map(|v| coerce_boolean(v).map_or(SqlValue::Null, SqlValue::Boolean))
                        .collect(),
                )
            } else {
                sanitize_column(column)
            };

            let kind = if values.iter().all(SqlValue::is_null) {
                SanitizedKind::Null
            } else {
                kind
            };

            columns.push(column.name.clone());
            kinds.push(kind);
            cleaned.push(values);
        }

        let rows = (0..batch.len())
            .map(|row| {
                cleaned
                    .iter_mut()
                    .map(|col| std::mem::replace(&mut col[row], SqlValue::Null))
                    .collect()
            })
            .collect();

        SanitizedBatch {
            index: batch.index,
            columns,
            kinds,
            rows,
        }
    }
}

/// Map a boolean-column value to true/false, or `None` when ambiguous.
pub fn coerce_boolean(value: &RawValue) -> Option<bool> {
    match value {
        RawValue::Integer(1) => Some(true),
        RawValue::Integer(0) => Some(false),
        RawValue::Float(f) if *f == 1.0 => Some(true),
        RawValue::Float(f) if *f == 0.0 => Some(false),
        RawValue::Text(s) if TRUE_TOKENS.contains(&s.as_str()) => Some(true),
        RawValue::Text(s) if FALSE_TOKENS.contains(&s.as_str()) => Some(false),
        _ => None,
    }
}

fn normalize_missing(value: &RawValue) -> SqlValue {
    match value {
        RawValue::Missing => SqlValue::Null,
        RawValue::Float(f) if f.is_nan() => SqlValue::Null,
        RawValue::Text(s) if is_native_missing(s) => SqlValue::Null,
        RawValue::Integer(v) => SqlValue::Integer(*v),
        RawValue::Float(f) => SqlValue::Float(*f),
        RawValue::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn sanitize_column(column: &SourceColumn) -> (SanitizedKind, Vec<SqlValue>) {
    let values: Vec<SqlValue> = column.values.iter().map(normalize_missing).collect();

    match column.storage {
        ColumnStorage::Float => match narrow_whole_floats(&values) {
            Some(integers) => (SanitizedKind::Integer, integers),
            None => (SanitizedKind::Float, values),
        },
        ColumnStorage::Integer => (SanitizedKind::Integer, values),
        ColumnStorage::Text => (SanitizedKind::Text, values),
        ColumnStorage::Empty => (SanitizedKind::Null, values),
    }
}

/// Re-type a float column as integer if every non-null value is whole and
/// fits in `i64`. Any value that cannot be checked leaves the column as float.
fn narrow_whole_floats(values: &[SqlValue]) -> Option<Vec<SqlValue>> {
    // 2^63: the first f64 above i64::MAX
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

    if values.iter().all(SqlValue::is_null) {
        return None;
    }

    values
        .iter()
        .map(|value| match value {
            SqlValue::Null => Some(SqlValue::Null),
            SqlValue::Integer(v) => Some(SqlValue::Integer(*v)),
            SqlValue::Float(f)
                if f.is_finite() && f.trunc() == *f && *f >= -I64_BOUND && *f < I64_BOUND =>
            {
                Some(SqlValue::Integer(*f as i64))
            },
            _ => None,
        })
        .collect()
}
