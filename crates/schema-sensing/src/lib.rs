//! Schema Sensing - table and column derivation from MQTT telemetry.
//!
//! Maps topics to table names, payload keys to column names and JSON values
//! to column types. Everything here is pure; nothing touches storage.
//!
//! # Example
//!
//! ```
//! use schema_sensing::{column_name_for, infer_type, table_name_for};
//! use teleforge_core::ColumnType;
//!
//! assert_eq!(table_name_for("Sensoren/DHT11").as_str(), "Sensoren_DHT11");
//! assert_eq!(column_name_for("battery.level"), "battery_level");
//! assert_eq!(infer_type(&serde_json::json!(21.5)), ColumnType::Numeric);
//! ```

mod inference;
mod naming;

pub use inference::{canonical_json, fits_numeric, infer_type};
pub use naming::{
    MAX_IDENTIFIER_LEN, checked_column_name, checked_table_name,
    column_name_for, is_reserved_column, table_name_for, validate_identifier,
};
