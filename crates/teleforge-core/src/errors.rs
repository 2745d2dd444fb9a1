use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("table already exists: {table}")]
    TableExists { table: String },

    #[error("column already exists on {table}: {details}")]
    ColumnExists {
        table: String,
        details: Cow<'static, str>,
    },

    #[error("storage unavailable: {details}")]
    Unavailable { details: Cow<'static, str> },

    #[error("permission error: {details}")]
    Permission { details: Cow<'static, str> },

    #[error("timeout during {action}")]
    Timeout { action: Cow<'static, str> },

    #[error("statement rejected: {details}")]
    Rejected { details: Cow<'static, str> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::TableNotFound { .. } => "table_not_found",
            StorageError::TableExists { .. } => "table_exists",
            StorageError::ColumnExists { .. } => "column_exists",
            StorageError::Unavailable { .. } => "unavailable",
            StorageError::Permission { .. } => "permission",
            StorageError::Timeout { .. } => "timeout",
            StorageError::Rejected { .. } => "rejected",
            StorageError::Other(_) => "other",
        }
    }

    /// Connectivity-class failures that a caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::Timeout { .. }
        )
    }
}

/// Per-message failure taxonomy. None of these stop the pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bad payload on {topic}: {reason}")]
    BadPayload {
        topic: String,
        reason: Cow<'static, str>,
    },

    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: &'static str },

    #[error("schema conflict on {table}.{column}: {reason}")]
    SchemaConflict {
        table: String,
        column: String,
        reason: Cow<'static, str>,
    },

    #[error("unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("value for {column} too long: {len} > {max} characters")]
    ValueTooLong {
        column: String,
        len: usize,
        max: usize,
    },

    #[error("value for {column} out of range: {value}")]
    ValueOutOfRange { column: String, value: String },

    #[error("type mismatch for {column}: expected {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("storage unavailable: {details}")]
    StorageUnavailable { details: Cow<'static, str> },

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable { details } => {
                IngestError::StorageUnavailable { details }
            }
            StorageError::Timeout { action } => {
                IngestError::StorageUnavailable {
                    details: format!("timeout during {action}").into(),
                }
            }
            other => IngestError::Storage(other),
        }
    }
}

impl IngestError {
    /// Stable label used for the `reason` metric dimension and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::BadPayload { .. } => "bad_payload",
            IngestError::InvalidIdentifier { .. } => "invalid_identifier",
            IngestError::SchemaConflict { .. } => "schema_conflict",
            IngestError::UnknownColumn { .. } => "unknown_column",
            IngestError::ValueTooLong { .. } => "value_too_long",
            IngestError::ValueOutOfRange { .. } => "value_out_of_range",
            IngestError::TypeMismatch { .. } => "type_mismatch",
            IngestError::StorageUnavailable { .. } => "storage_unavailable",
            IngestError::Storage(_) => "storage",
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_and_timeout_map_to_storage_unavailable() {
        let e: IngestError = StorageError::Unavailable {
            details: "connection refused".into(),
        }
        .into();
        assert_eq!(e.kind(), "storage_unavailable");

        let e: IngestError = StorageError::Timeout {
            action: "insert_row".into(),
        }
        .into();
        match e {
            IngestError::StorageUnavailable { details } => {
                assert!(details.contains("insert_row"))
            }
            other => panic!("expected StorageUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn other_storage_errors_are_wrapped() {
        let e: IngestError = StorageError::Rejected {
            details: "data too long".into(),
        }
        .into();
        assert!(matches!(e, IngestError::Storage(StorageError::Rejected { .. })));
        assert_eq!(e.kind(), "storage");
    }

    #[test]
    fn transient_classification() {
        assert!(
            StorageError::Timeout {
                action: "probe".into()
            }
            .is_transient()
        );
        assert!(
            !StorageError::TableExists {
                table: "t".into()
            }
            .is_transient()
        );
    }
}
