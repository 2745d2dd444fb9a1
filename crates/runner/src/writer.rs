//! Parameterized row inserts.

use std::collections::HashSet;

use schema_sensing::{canonical_json, checked_column_name, fits_numeric};
use serde_json::Value;
use teleforge_config::TextOverflow;
use teleforge_core::{
    ArcDynStorage, ColumnSpec, ColumnType, IngestError, IngestResult, Message,
    RowInsert, SENSOR_ID_COLUMN, SqlValue, TEXT_MAX_CHARS, TableSchema,
    json_kind,
};
use tracing::{debug, warn};

pub struct RowWriter {
    storage: ArcDynStorage,
    text_overflow: TextOverflow,
}

impl RowWriter {
    pub fn new(storage: ArcDynStorage, text_overflow: TextOverflow) -> Self {
        Self {
            storage,
            text_overflow,
        }
    }

    /// Bind every field of `msg` to a column of `schema`.
    ///
    /// Fails as a whole if any key has no column or any value does not fit
    /// its column; nothing is written in that case.
    pub fn build_insert(
        &self,
        schema: &TableSchema,
        msg: &Message,
    ) -> IngestResult<RowInsert> {
        let mut seen = HashSet::with_capacity(msg.fields.len());
        let mut values = Vec::with_capacity(msg.fields.len());

        for (key, value) in &msg.fields {
            let name = checked_column_name(&schema.name, key)?;
            let column = schema.column(&name).ok_or_else(|| {
                IngestError::UnknownColumn {
                    table: schema.name.to_string(),
                    column: name.clone(),
                }
            })?;
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(IngestError::SchemaConflict {
                    table: schema.name.to_string(),
                    column: column.name.clone(),
                    reason: format!("key {key:?} maps to a column already bound").into(),
                });
            }
            values.push((column.name.clone(), self.bind(column, value)?));
        }

        Ok(RowInsert {
            table: schema.name.clone(),
            received_at: msg.received_at,
            sensor_id: self.bounded_text(SENSOR_ID_COLUMN, msg.sensor_id.clone())?,
            values,
        })
    }

    /// Build and execute the insert. Returns affected rows.
    pub async fn insert(
        &self,
        schema: &TableSchema,
        msg: &Message,
    ) -> IngestResult<u64> {
        let row = self.build_insert(schema, msg)?;
        let affected = self.storage.insert_row(&row).await?;
        debug!(table = %row.table, sensor_id = %row.sensor_id, columns = row.values.len(), "row inserted");
        Ok(affected)
    }

    fn bind(&self, column: &ColumnSpec, value: &Value) -> IngestResult<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }

        match column.column_type {
            ColumnType::Numeric => match value {
                Value::Number(n) => {
                    if !fits_numeric(n) {
                        return Err(IngestError::ValueOutOfRange {
                            column: column.name.clone(),
                            value: n.to_string(),
                        });
                    }
                    if let Some(i) = n.as_i64() {
                        Ok(SqlValue::Int(i))
                    } else if let Some(u) = n.as_u64() {
                        Ok(SqlValue::UInt(u))
                    } else {
                        n.as_f64().map(SqlValue::Float).ok_or_else(|| {
                            IngestError::ValueOutOfRange {
                                column: column.name.clone(),
                                value: n.to_string(),
                            }
                        })
                    }
                }
                other => Err(type_mismatch(column, "number", other)),
            },
            ColumnType::Text => match value {
                Value::String(s) => {
                    Ok(SqlValue::Text(self.bounded_text(&column.name, s.clone())?))
                }
                Value::Number(_) | Value::Bool(_) => Ok(SqlValue::Text(
                    self.bounded_text(&column.name, value.to_string())?,
                )),
                other => Err(type_mismatch(column, "string", other)),
            },
            ColumnType::Opaque => Ok(SqlValue::Text(canonical_json(value))),
        }
    }

    /// Apply the overflow policy to a value headed for a bounded column.
    fn bounded_text(&self, column: &str, s: String) -> IngestResult<String> {
        let len = s.chars().count();
        if len <= TEXT_MAX_CHARS {
            return Ok(s);
        }
        match self.text_overflow {
            TextOverflow::Reject => Err(IngestError::ValueTooLong {
                column: column.to_string(),
                len,
                max: TEXT_MAX_CHARS,
            }),
            TextOverflow::Truncate => {
                warn!(column, len, max = TEXT_MAX_CHARS, "truncating text value");
                Ok(s.chars().take(TEXT_MAX_CHARS).collect())
            }
        }
    }
}

fn type_mismatch(column: &ColumnSpec, expected: &'static str, found: &Value) -> IngestError {
    IngestError::TypeMismatch {
        column: column.name.clone(),
        expected,
        found: json_kind(found),
    }
}
