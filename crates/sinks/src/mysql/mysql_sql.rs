//! Statement rendering for the MySQL backend.
//!
//! Identifiers reach this module already allowlisted; they are still
//! backtick-quoted everywhere. Values are never interpolated.

use chrono::{DateTime, Datelike, Timelike, Utc};
use mysql_async::Value;
use teleforge_core::{
    ColumnSpec, ColumnType, FIXED_COLUMNS, ID_COLUMN, NUMERIC_PRECISION,
    NUMERIC_SCALE, RowInsert, SENSOR_ID_COLUMN, SqlValue, TEXT_MAX_CHARS,
    TIMESTAMP_COLUMN, TableSchema,
};

pub(crate) const DESCRIBE_SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub(crate) fn sql_type(t: ColumnType) -> String {
    match t {
        ColumnType::Numeric => {
            format!("DECIMAL({NUMERIC_PRECISION},{NUMERIC_SCALE})")
        }
        ColumnType::Text => format!("VARCHAR({TEXT_MAX_CHARS})"),
        ColumnType::Opaque => "TEXT".to_string(),
    }
}

fn column_def(c: &ColumnSpec) -> String {
    format!("{} {} NULL", quote_ident(&c.name), sql_type(c.column_type))
}

pub(crate) fn render_create_table(schema: &TableSchema) -> String {
    let mut defs = vec![
        format!(
            "{} BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY",
            quote_ident(ID_COLUMN)
        ),
        format!("{} DATETIME(3) NOT NULL", quote_ident(TIMESTAMP_COLUMN)),
        format!(
            "{} VARCHAR({TEXT_MAX_CHARS}) NOT NULL",
            quote_ident(SENSOR_ID_COLUMN)
        ),
    ];
    defs.extend(schema.columns.iter().map(column_def));

    format!(
        "CREATE TABLE {} ({})",
        quote_ident(schema.name.as_str()),
        defs.join(", ")
    )
}

pub(crate) fn render_add_columns(table: &str, columns: &[ColumnSpec]) -> String {
    let adds: Vec<String> = columns
        .iter()
        .map(|c| format!("ADD COLUMN {}", column_def(c)))
        .collect();
    format!("ALTER TABLE {} {}", quote_ident(table), adds.join(", "))
}

pub(crate) fn render_insert(row: &RowInsert) -> String {
    let cols = row.column_names();
    let quoted: Vec<String> = cols.iter().map(|c| quote_ident(c)).collect();
    let marks = vec!["?"; cols.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(row.table.as_str()),
        quoted.join(", "),
        marks
    )
}

pub(crate) fn to_mysql_value(v: SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::NULL,
        SqlValue::Int(i) => Value::Int(i),
        SqlValue::UInt(u) => Value::UInt(u),
        SqlValue::Float(f) => Value::Double(f),
        SqlValue::Text(s) => Value::Bytes(s.into_bytes()),
        SqlValue::Timestamp(ts) => datetime_value(ts),
    }
}

fn datetime_value(ts: DateTime<Utc>) -> Value {
    let n = ts.naive_utc();
    Value::Date(
        n.year() as u16,
        n.month() as u8,
        n.day() as u8,
        n.hour() as u8,
        n.minute() as u8,
        n.second() as u8,
        n.nanosecond() / 1_000 % 1_000_000,
    )
}

/// Column type for an `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE`.
pub(crate) fn column_type_for(data_type: &str) -> ColumnType {
    match data_type.to_ascii_lowercase().as_str() {
        "decimal" | "numeric" | "int" | "integer" | "tinyint" | "smallint"
        | "mediumint" | "bigint" | "float" | "double" | "real" => {
            ColumnType::Numeric
        }
        "varchar" | "char" => ColumnType::Text,
        _ => ColumnType::Opaque,
    }
}

pub(crate) fn is_fixed_column(name: &str) -> bool {
    FIXED_COLUMNS.iter().any(|f| f.eq_ignore_ascii_case(name))
}
