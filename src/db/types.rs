//! Result types shared by every backend.
//!
//! Backends normalise their driver-specific rows and column descriptions into
//! these shapes at the adapter boundary; nothing above the `db` module ever
//! sees a driver type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A row of data from a cursor.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
///
/// Serialises untagged so rows render as plain JSON arrays.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// 32-bit (or narrower) signed integer.
    Int(i32),

    /// 64-bit signed integer.
    BigInt(i64),

    /// Floating point number.
    Float(f64),

    /// Date, time or timestamp, kept in the backend's textual form.
    Timestamp(String),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Maps the runtime kind of this value to a logical column type.
    pub fn logical_type(&self) -> LogicalType {
        match self {
            Value::Int(_) => LogicalType::Int,
            Value::BigInt(_) => LogicalType::BigInt,
            Value::Float(_) => LogicalType::Float,
            Value::Bool(_) => LogicalType::Boolean,
            Value::Timestamp(_) => LogicalType::Timestamp,
            Value::Null | Value::String(_) | Value::Bytes(_) => LogicalType::String,
        }
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Timestamp(s) | Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }

    /// Renders the value for a flat export cell (NULL becomes empty).
    pub fn to_export_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_display_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Logical column type tag exposed to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalType {
    Int,
    BigInt,
    Float,
    Boolean,
    Timestamp,
    #[default]
    String,
}

impl LogicalType {
    /// Returns the tag as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::BigInt => "BIGINT",
            Self::Float => "FLOAT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::String => "STRING",
        }
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,

    /// Logical type, inferred from observed values.
    #[serde(rename = "type")]
    pub logical_type: LogicalType,

    /// Free-form comment (usually empty).
    #[serde(default)]
    pub comment: String,
}

impl ColumnMeta {
    /// Creates column metadata with the default STRING type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logical_type: LogicalType::String,
            comment: String::new(),
        }
    }

    /// Sets the logical type.
    pub fn with_type(mut self, logical_type: LogicalType) -> Self {
        self.logical_type = logical_type;
        self
    }
}

/// One page of results returned by the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchBatch {
    /// Whether the cursor may still hold more rows.
    pub has_more: bool,

    /// Rows in cursor order.
    pub data: Vec<Row>,

    /// Column metadata for the rows.
    pub meta: Vec<ColumnMeta>,

    /// Result shape; always `"table"`.
    #[serde(rename = "type")]
    pub kind: ResultKind,
}

impl FetchBatch {
    /// Creates a batch of table rows.
    pub fn table(data: Vec<Row>, meta: Vec<ColumnMeta>, has_more: bool) -> Self {
        Self {
            has_more,
            data,
            meta,
            kind: ResultKind::Table,
        }
    }

    /// Column names in order.
    pub fn headers(&self) -> Vec<String> {
        self.meta.iter().map(|c| c.name.clone()).collect()
    }
}

/// Shape of a result payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    #[default]
    Table,
}

/// Remote execution state reported by a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Waiting,
    Running,
    Submitted,
    Available,
    Canceled,
    Failed,
}

impl PollState {
    /// Returns true while the remote side has not reached a final state.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Submitted)
    }

    /// Returns the state as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Submitted => "submitted",
            Self::Available => "available",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of submitting a statement to a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Execution is already final; no status polling is needed.
    Finished,
    /// The backend completes asynchronously; poll until available.
    Pending,
}
