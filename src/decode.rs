// Row decoding - turns schema-less result rows into metric records
//
// The diagnostic queries return arbitrary column sets that are only known once
// the server has answered. Every row is classified column by column:
// 1. The reserved `measurement` column names the metric
// 2. Columns listed in the configured tag keys become string tags
// 3. Everything else becomes a field with its native value

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Name of the column that carries the measurement name
pub const MEASUREMENT_COLUMN: &str = "measurement";

/// Errors that can occur while classifying a single row
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("row has no 'measurement' column")]
    MissingMeasurement,

    #[error("'measurement' column must be text, found {found}")]
    NonTextMeasurement { found: &'static str },

    #[error("tag column '{column}' must be text, found {found}")]
    NonTextTag { column: String, found: &'static str },
}

/// A dynamically typed column value as reported by the driver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Short name of the value's type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Column names that must be emitted as tags instead of fields
#[derive(Debug, Clone, Default)]
pub struct TagKeySet(HashSet<String>);

impl TagKeySet {
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }
}

impl<S: Into<String>> FromIterator<S> for TagKeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TagKeySet(iter.into_iter().map(Into::into).collect())
    }
}

/// One result row: the column names of its result set plus one value per column
///
/// Column names are shared between all rows of the same result set, so the
/// driver only has to discover them once per query.
#[derive(Debug, Clone)]
pub struct RawRow {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl RawRow {
    /// Creates a row from shared column names and this row's values
    ///
    /// Surplus values or columns are ignored; drivers report exactly one value
    /// per column.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        RawRow { columns, values }
    }

    /// Builds a row from (name, value) pairs
    #[cfg(test)]
    pub fn from_pairs<N, V, I>(pairs: I) -> Self
    where
        N: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (N, V)>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .unzip();
        RawRow {
            columns: columns.into(),
            values,
        }
    }
}

/// A normalized metric produced from exactly one row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Converts one row into a metric record
///
/// Classification is done in a single pass, keyed on column names only. The
/// timestamp is the wall-clock time of the conversion because the diagnostic
/// queries don't report a usable one.
///
/// # Errors
/// * `DecodeError::MissingMeasurement` - the row has no `measurement` column
/// * `DecodeError::NonTextMeasurement` / `NonTextTag` - a column that must be
///   text holds a different type (including null)
pub fn decode_row(row: RawRow, tag_keys: &TagKeySet) -> Result<MetricRecord, DecodeError> {
    let timestamp = Utc::now();

    let mut measurement = None;
    let mut tags = BTreeMap::new();
    let mut fields = BTreeMap::new();

    for (column, value) in row.columns.iter().zip(row.values) {
        if column == MEASUREMENT_COLUMN {
            match value {
                Value::Text(name) => measurement = Some(name),
                other => {
                    return Err(DecodeError::NonTextMeasurement {
                        found: other.type_name(),
                    })
                }
            }
        } else if tag_keys.contains(column) {
            match value {
                Value::Text(tag) => {
                    tags.insert(column.clone(), tag);
                }
                other => {
                    return Err(DecodeError::NonTextTag {
                        column: column.clone(),
                        found: other.type_name(),
                    })
                }
            }
        } else {
            fields.insert(column.clone(), value);
        }
    }

    let measurement = measurement.ok_or(DecodeError::MissingMeasurement)?;

    Ok(MetricRecord {
        measurement,
        tags,
        fields,
        timestamp,
    })
}
