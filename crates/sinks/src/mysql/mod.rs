//! MySQL storage backend.
//!
//! Each primitive checks a connection out of the pool, runs one statement
//! under the operation timeout and hands the connection back on drop.

mod mysql_errors;
mod mysql_sql;

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use common::{DsnComponents, redact_url_password};
use mysql_async::{
    Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts,
    prelude::Queryable,
};
use teleforge_config::MySqlStorageCfg;
use teleforge_core::{
    ColumnSpec, RowInsert, Storage, StorageError, StorageResult, TableName,
    TableSchema,
};
use tokio::time::timeout;
use tracing::{debug, info};

use mysql_errors::classify;
use mysql_sql::{
    DESCRIBE_SQL, column_type_for, is_fixed_column, render_add_columns,
    render_create_table, render_insert, to_mysql_value,
};

const MYSQL_DEFAULT_PORT: u16 = 3306;
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MySqlStorage {
    id: String,
    pool: Pool,
    endpoint: String,
    op_timeout: Duration,
}

impl MySqlStorage {
    /// Build the pool. No connection is opened until the first operation.
    pub fn new(cfg: &MySqlStorageCfg) -> anyhow::Result<Self> {
        let dsn_redacted = redact_url_password(&cfg.dsn);
        let comp = DsnComponents::from_url(&cfg.dsn, MYSQL_DEFAULT_PORT)
            .map_err(|e| anyhow::anyhow!("parse mysql dsn {dsn_redacted}: {e}"))?;
        anyhow::ensure!(
            !comp.database.is_empty(),
            "mysql dsn {dsn_redacted} does not name a database"
        );
        let opts = Opts::from_url(&cfg.dsn)
            .with_context(|| format!("parse mysql dsn {dsn_redacted}"))?;

        let max = cfg.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let opts = pool_opts(cfg, opts, max)?;

        info!(
            storage = %cfg.id,
            endpoint = %comp.endpoint(),
            authenticated = comp.has_credentials() || cfg.user.is_some(),
            max_connections = max,
            "mysql storage configured"
        );

        Ok(Self {
            id: cfg.id.clone(),
            pool: Pool::new(opts),
            endpoint: comp.endpoint(),
            op_timeout: cfg
                .op_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_OP_TIMEOUT),
        })
    }

    /// Run `op` on a pooled connection under the operation timeout.
    async fn with_conn<T, F, Fut>(
        &self,
        action: &'static str,
        table: &str,
        op: F,
    ) -> StorageResult<T>
    where
        F: FnOnce(Conn) -> Fut,
        Fut: Future<Output = Result<T, mysql_async::Error>>,
    {
        let fut = async {
            let conn = self.pool.get_conn().await?;
            op(conn).await
        };
        match timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(|e| classify(e, table)),
            Err(_) => Err(StorageError::Timeout {
                action: format!("{action} on {}", self.endpoint).into(),
            }),
        }
    }
}

/// Pool sizing plus the optional `user`/`password` overrides, which keep
/// credentials with URL-reserved characters out of the DSN.
fn pool_opts(cfg: &MySqlStorageCfg, opts: Opts, max: usize) -> anyhow::Result<Opts> {
    let constraints = PoolConstraints::new(1, max)
        .with_context(|| format!("invalid pool size {max}"))?;
    let mut builder = OptsBuilder::from_opts(opts)
        .pool_opts(PoolOpts::default().with_constraints(constraints));
    if let Some(user) = &cfg.user {
        builder = builder.user(Some(user.clone()));
    }
    if let Some(password) = &cfg.password {
        builder = builder.pass(Some(password.clone()));
    }
    Ok(builder.into())
}

#[async_trait]
impl Storage for MySqlStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> StorageResult<()> {
        self.with_conn("ping", "", |mut conn| async move {
            conn.query_drop("SELECT 1").await
        })
        .await
    }

    async fn describe_table(
        &self,
        table: &TableName,
    ) -> StorageResult<Option<TableSchema>> {
        let name = table.as_str().to_string();
        let rows: Vec<(String, String)> = self
            .with_conn("describe_table", table.as_str(), |mut conn| async move {
                conn.exec::<(String, String), _, _>(DESCRIBE_SQL, (name,)).await
            })
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .into_iter()
            .filter(|(name, _)| !is_fixed_column(name))
            .map(|(name, data_type)| {
                ColumnSpec::new(name, column_type_for(&data_type))
            })
            .collect();

        Ok(Some(TableSchema {
            name: table.clone(),
            columns,
            created_at: Utc::now(),
        }))
    }

    async fn create_table(&self, schema: &TableSchema) -> StorageResult<()> {
        let sql = render_create_table(schema);
        debug!(storage = %self.id, table = %schema.name, %sql, "creating table");
        self.with_conn("create_table", schema.name.as_str(), |mut conn| async move {
            conn.query_drop(sql).await
        })
        .await
    }

    async fn add_columns(
        &self,
        table: &TableName,
        columns: &[ColumnSpec],
    ) -> StorageResult<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let sql = render_add_columns(table.as_str(), columns);
        debug!(storage = %self.id, %table, %sql, "adding columns");
        self.with_conn("add_columns", table.as_str(), |mut conn| async move {
            conn.query_drop(sql).await
        })
        .await
    }

    async fn insert_row(&self, row: &RowInsert) -> StorageResult<u64> {
        let sql = render_insert(row);
        let params: Vec<mysql_async::Value> =
            row.params().into_iter().map(to_mysql_value).collect();

        self.with_conn("insert_row", row.table.as_str(), |mut conn| async move {
            conn.exec_drop(sql, params).await?;
            Ok(conn.affected_rows())
        })
        .await
    }
}
