//! Topic and key sanitization.
//!
//! Names derived here are interpolated into DDL/DML as quoted identifiers,
//! so every name passes the identifier allowlist before it is used.

use teleforge_core::{FIXED_COLUMNS, IngestError, IngestResult, TableName};

/// MySQL identifier length limit.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Table name for a topic: `/` becomes `_`, `+` is dropped, case is kept.
///
/// Not injective: `A/B` and `A_B` both map to `A_B`.
pub fn table_name_for(topic: &str) -> TableName {
    let name: String = topic
        .chars()
        .filter(|c| *c != '+')
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    TableName::new(name)
}

/// Column name for a JSON key: `.` and `-` become `_`.
pub fn column_name_for(key: &str) -> String {
    key.replace(['.', '-'], "_")
}

/// Allowlist check: ASCII alphanumerics, `_` and `$`, 1..=64 characters.
pub fn validate_identifier(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("identifier is empty");
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err("identifier longer than 64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        return Err("identifier contains characters outside [A-Za-z0-9_$]");
    }
    Ok(())
}

/// True if `name` collides with one of the fixed columns. MySQL column
/// names compare case-insensitively.
pub fn is_reserved_column(name: &str) -> bool {
    FIXED_COLUMNS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// Sanitized and allowlisted table name for a topic.
pub fn checked_table_name(topic: &str) -> IngestResult<TableName> {
    let table = table_name_for(topic);
    validate_identifier(table.as_str()).map_err(|reason| {
        IngestError::InvalidIdentifier {
            name: table.to_string(),
            reason,
        }
    })?;
    Ok(table)
}

/// Sanitized and allowlisted column name for a payload key of `table`.
///
/// A name that lands on a fixed column is a `SchemaConflict`.
pub fn checked_column_name(table: &TableName, key: &str) -> IngestResult<String> {
    let column = column_name_for(key);
    validate_identifier(&column).map_err(|reason| {
        IngestError::InvalidIdentifier {
            name: column.clone(),
            reason,
        }
    })?;

    if is_reserved_column(&column) {
        return Err(IngestError::SchemaConflict {
            table: table.to_string(),
            column,
            reason: format!("key {key:?} collides with a fixed column").into(),
        });
    }

    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn topic_slashes_become_underscores() {
        assert_eq!(table_name_for("Sensoren/DHT11").as_str(), "Sensoren_DHT11");
        assert_eq!(table_name_for("a/b/c").as_str(), "a_b_c");
    }

    #[test]
    fn plus_is_removed_and_case_kept() {
        assert_eq!(table_name_for("Home/+/Temp").as_str(), "Home__Temp");
        assert_eq!(table_name_for("A+B").as_str(), "AB");
    }

    #[test]
    fn documented_collision() {
        assert_eq!(table_name_for("A/B"), table_name_for("A_B"));
    }

    #[test]
    fn other_characters_do_not_collide() {
        assert_ne!(table_name_for("A/B"), table_name_for("A/C"));
        assert_ne!(table_name_for("a/b"), table_name_for("A/B"));
    }

    #[test]
    fn table_name_is_a_fixed_point() {
        for topic in ["Sensoren/DHT11", "x/+/y", "plain", "+/+"] {
            let once = table_name_for(topic);
            let twice = table_name_for(once.as_str());
            assert_eq!(once, twice, "topic {topic:?}");
        }
    }

    #[test]
    fn key_dots_and_dashes_become_underscores() {
        assert_eq!(column_name_for("battery.level"), "battery_level");
        assert_eq!(column_name_for("rssi-dbm"), "rssi_dbm");
        assert_eq!(column_name_for("temp"), "temp");
    }

    #[test]
    fn allowlist() {
        assert!(validate_identifier("Sensoren_DHT11").is_ok());
        assert!(validate_identifier("cost$").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier("drop`table").is_err());
        assert!(validate_identifier("temp°C").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_ok());
        assert!(validate_identifier(&"x".repeat(65)).is_err());
    }

    #[test]
    fn checked_table_name_rejects_unsafe_topics() {
        let err = checked_table_name("room 1/temp").unwrap_err();
        assert_eq!(err.kind(), "invalid_identifier");
        assert!(checked_table_name("").is_err());
        assert!(checked_table_name("+").is_err());
    }

    #[test]
    fn reserved_columns_conflict() {
        let table = TableName::new("t");
        for key in ["timestamp", "sensor-id", "sensor.id", "ID", "TimeStamp"] {
            let err = checked_column_name(&table, key).unwrap_err();
            assert_eq!(err.kind(), "schema_conflict", "key {key:?}");
        }
        assert_eq!(checked_column_name(&table, "sensor-type").unwrap(), "sensor_type");
    }
}
