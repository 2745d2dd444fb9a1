//! TeleForge Core Types
//!
//! Messages as they arrive from the broker, the table/column model derived
//! from them, the bind-parameter representation handed to storage, and the
//! `Storage` trait every relational backend implements.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod errors;
pub use errors::{IngestError, IngestResult, StorageError, StorageResult};

// ============================================================================
// Fixed layout
// ============================================================================

/// Surrogate key, auto-incremented by storage.
pub const ID_COLUMN: &str = "id";
/// Receipt time of the message on this side of the broker.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// Identifier extracted from the payload's `id` key.
pub const SENSOR_ID_COLUMN: &str = "sensor_id";

/// Columns every provisioned table starts with, in order.
pub const FIXED_COLUMNS: [&str; 3] =
    [ID_COLUMN, TIMESTAMP_COLUMN, SENSOR_ID_COLUMN];

/// Payload key that carries the sensor identifier.
pub const SENSOR_ID_KEY: &str = "id";
pub const UNKNOWN_SENSOR: &str = "UNKNOWN";

/// Maximum length (characters) of `Text` columns and `sensor_id`.
pub const TEXT_MAX_CHARS: usize = 255;
/// `DECIMAL(14,4)`: 10 integer digits, 4 fractional digits.
pub const NUMERIC_PRECISION: u32 = 14;
pub const NUMERIC_SCALE: u32 = 4;
pub const NUMERIC_INTEGER_DIGITS: i32 = (NUMERIC_PRECISION - NUMERIC_SCALE) as i32;

// ============================================================================
// Messages
// ============================================================================

/// Decoded JSON object, in payload key order.
pub type Fields = serde_json::Map<String, Value>;

/// Raw delivery from the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// A telemetry message with the sensor id split off from its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub received_at: DateTime<Utc>,
    pub sensor_id: String,
    pub fields: Fields,
}

impl Message {
    /// Parse the payload as a JSON object and extract the `id` key.
    ///
    /// Anything that is not UTF-8 JSON with an object at the top level is
    /// a `BadPayload`.
    pub fn decode(inbound: &InboundMessage) -> IngestResult<Self> {
        let bad = |reason: String| IngestError::BadPayload {
            topic: inbound.topic.clone(),
            reason: reason.into(),
        };

        let text = std::str::from_utf8(&inbound.payload)
            .map_err(|e| bad(format!("payload is not utf-8: {e}")))?;

        let value: Value = serde_json::from_str(text)
            .map_err(|e| bad(format!("payload is not json: {e}")))?;

        let Value::Object(mut fields) = value else {
            return Err(bad(format!(
                "payload is a json {}, expected an object",
                json_kind(&value)
            )));
        };

        let sensor_id = match fields.shift_remove(SENSOR_ID_KEY) {
            None | Some(Value::Null) => UNKNOWN_SENSOR.to_string(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        };

        Ok(Self {
            topic: inbound.topic.clone(),
            received_at: inbound.received_at,
            sensor_id,
            fields,
        })
    }
}

/// Short name of a JSON value's shape, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Table model
// ============================================================================

/// Sanitized table name. Construction is left to the name sanitizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Column type domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Fixed-precision decimal.
    Numeric,
    /// Bounded string.
    Text,
    /// Unbounded text holding canonical JSON.
    Opaque,
}

impl ColumnType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Opaque => "opaque",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Derived columns of a table. The fixed columns are implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: TableName,
    pub columns: Vec<ColumnSpec>,
    /// When this process learned the schema (created or probed).
    pub created_at: DateTime<Utc>,
}

impl TableSchema {
    pub fn new(name: TableName, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name,
            columns,
            created_at: Utc::now(),
        }
    }

    /// Get column by (sanitized) name. Matching ignores ASCII case, as
    /// MySQL column names do.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Copy of this schema with `extra` appended.
    pub fn extended(&self, extra: &[ColumnSpec]) -> Self {
        let mut columns = self.columns.clone();
        columns.extend_from_slice(extra);
        Self {
            name: self.name.clone(),
            columns,
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// Row insert
// ============================================================================

/// Typed bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// A validated insert: every value is already bound to an existing column.
#[derive(Debug, Clone, PartialEq)]
pub struct RowInsert {
    pub table: TableName,
    pub received_at: DateTime<Utc>,
    pub sensor_id: String,
    /// `(column, value)` in payload key order.
    pub values: Vec<(String, SqlValue)>,
}

impl RowInsert {
    /// Column list of the statement, fixed columns first (`id` is assigned
    /// by storage and never listed).
    pub fn column_names(&self) -> Vec<&str> {
        let mut cols = vec![TIMESTAMP_COLUMN, SENSOR_ID_COLUMN];
        cols.extend(self.values.iter().map(|(c, _)| c.as_str()));
        cols
    }

    /// Bind parameters matching `column_names()`.
    pub fn params(&self) -> Vec<SqlValue> {
        let mut params = Vec::with_capacity(self.values.len() + 2);
        params.push(SqlValue::Timestamp(self.received_at));
        params.push(SqlValue::Text(self.sensor_id.clone()));
        params.extend(self.values.iter().map(|(_, v)| v.clone()));
        params
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Relational storage the ingest core depends on.
///
/// Implementations must report "table not found" and "table already
/// exists" as the dedicated `StorageError` variants so the provisioner can
/// tell a lost creation race from a real failure.
#[async_trait]
pub trait Storage: Send + Sync {
    fn id(&self) -> &str;

    /// Cheap connectivity check.
    async fn ping(&self) -> StorageResult<()>;

    /// Probe a table. `Ok(None)` means it does not exist.
    async fn describe_table(
        &self,
        table: &TableName,
    ) -> StorageResult<Option<TableSchema>>;

    /// Create the table, failing with `TableExists` if it is already there.
    async fn create_table(&self, schema: &TableSchema) -> StorageResult<()>;

    /// Add nullable columns to an existing table.
    async fn add_columns(
        &self,
        table: &TableName,
        columns: &[ColumnSpec],
    ) -> StorageResult<()>;

    /// Insert one row, returning the number of affected rows.
    async fn insert_row(&self, row: &RowInsert) -> StorageResult<u64>;
}

pub type ArcDynStorage = Arc<dyn Storage>;
