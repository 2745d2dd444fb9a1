use mysql_async::{Error as MySqlError, ServerError};
use teleforge_core::StorageError;
use tracing::warn;

// Server error codes the storage layer distinguishes.
pub(crate) const ER_DBACCESS_DENIED: u16 = 1044;
pub(crate) const ER_ACCESS_DENIED: u16 = 1045;
pub(crate) const ER_TABLE_EXISTS: u16 = 1050;
pub(crate) const ER_BAD_FIELD: u16 = 1054;
pub(crate) const ER_DUP_FIELDNAME: u16 = 1060;
pub(crate) const ER_TABLEACCESS_DENIED: u16 = 1142;
pub(crate) const ER_COLUMNACCESS_DENIED: u16 = 1143;
pub(crate) const ER_NO_SUCH_TABLE: u16 = 1146;
pub(crate) const ER_WARN_DATA_OUT_OF_RANGE: u16 = 1264;
pub(crate) const ER_TRUNCATED_WRONG_VALUE: u16 = 1366;
pub(crate) const ER_DATA_TOO_LONG: u16 = 1406;

/// Map a driver error to the storage taxonomy. `table` names the statement
/// target for the table-scoped variants.
pub(crate) fn classify(err: MySqlError, table: &str) -> StorageError {
    match err {
        MySqlError::Server(e) => classify_server(e, table),
        MySqlError::Io(e) => StorageError::Unavailable {
            details: format!("mysql io: {e}").into(),
        },
        MySqlError::Driver(e) => StorageError::Unavailable {
            details: format!("mysql driver: {e}").into(),
        },
        MySqlError::Url(e) => StorageError::Other(anyhow::anyhow!(
            "invalid mysql dsn: {e}"
        )),
        other => StorageError::Other(other.into()),
    }
}

fn classify_server(e: ServerError, table: &str) -> StorageError {
    match e.code {
        ER_TABLE_EXISTS => StorageError::TableExists {
            table: table.to_string(),
        },
        ER_NO_SUCH_TABLE => StorageError::TableNotFound {
            table: table.to_string(),
        },
        ER_DUP_FIELDNAME => StorageError::ColumnExists {
            table: table.to_string(),
            details: e.message.into(),
        },
        ER_DBACCESS_DENIED | ER_ACCESS_DENIED => {
            warn!(code = e.code, "mysql rejected credentials");
            StorageError::Unavailable {
                details: format!("access denied ({}): {}", e.code, e.message)
                    .into(),
            }
        }
        ER_TABLEACCESS_DENIED | ER_COLUMNACCESS_DENIED => {
            StorageError::Permission {
                details: format!("{} ({})", e.message, e.code).into(),
            }
        }
        ER_BAD_FIELD | ER_WARN_DATA_OUT_OF_RANGE | ER_TRUNCATED_WRONG_VALUE
        | ER_DATA_TOO_LONG => StorageError::Rejected {
            details: format!("{} ({})", e.message, e.code).into(),
        },
        _ => StorageError::Other(anyhow::anyhow!(
            "mysql error {} ({}): {}",
            e.code,
            e.state,
            e.message
        )),
    }
}
