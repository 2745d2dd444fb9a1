//! In-memory storage.
//!
//! Same primitives and error semantics as the MySQL backend, without a
//! server. Backs `storage: {type: memory}` dry runs and the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use teleforge_core::{
    ColumnSpec, RowInsert, SqlValue, Storage, StorageError, StorageResult,
    TableName, TableSchema,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct MemRow {
    pub id: u64,
    pub received_at: DateTime<Utc>,
    pub sensor_id: String,
    pub values: Vec<(String, SqlValue)>,
}

impl MemRow {
    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }
}

#[derive(Debug)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<MemRow>,
}

#[derive(Default)]
pub struct MemStorage {
    id: String,
    tables: RwLock<HashMap<TableName, MemTable>>,
    next_row_id: AtomicU64,
    unavailable: AtomicBool,
    latency: Option<Duration>,
    describe_calls: AtomicUsize,
    create_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemStorage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sleep this long before every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every operation fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn table_names(&self) -> Vec<TableName> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_schema(&self, table: &TableName) -> Option<TableSchema> {
        self.tables.read().get(table).map(|t| t.schema.clone())
    }

    pub fn rows(&self, table: &TableName) -> Vec<MemRow> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Remove a table behind the back of any registry. Returns whether it existed.
    pub fn drop_table(&self, table: &TableName) -> bool {
        self.tables.write().remove(table).is_some()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.read().values().map(|t| t.rows.len()).sum()
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, action: &'static str) -> StorageResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                details: format!("{}: storage offline during {action}", self.id)
                    .into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> StorageResult<()> {
        self.enter("ping").await
    }

    async fn describe_table(
        &self,
        table: &TableName,
    ) -> StorageResult<Option<TableSchema>> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.enter("describe_table").await?;
        Ok(self.table_schema(table).map(|mut s| {
            s.created_at = Utc::now();
            s
        }))
    }

    async fn create_table(&self, schema: &TableSchema) -> StorageResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.enter("create_table").await?;

        let mut tables = self.tables.write();
        if tables.contains_key(&schema.name) {
            return Err(StorageError::TableExists {
                table: schema.name.to_string(),
            });
        }
        tables.insert(
            schema.name.clone(),
            MemTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        debug!(storage = %self.id, table = %schema.name, columns = ?schema.column_names(), "table created");
        Ok(())
    }

    async fn add_columns(
        &self,
        table: &TableName,
        columns: &[ColumnSpec],
    ) -> StorageResult<()> {
        self.enter("add_columns").await?;

        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| {
            StorageError::TableNotFound {
                table: table.to_string(),
            }
        })?;
        if let Some(dup) = columns.iter().find(|c| t.schema.column(&c.name).is_some())
        {
            return Err(StorageError::ColumnExists {
                table: table.to_string(),
                details: format!("duplicate column name '{}'", dup.name).into(),
            });
        }
        t.schema.columns.extend_from_slice(columns);
        Ok(())
    }

    async fn insert_row(&self, row: &RowInsert) -> StorageResult<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.enter("insert_row").await?;

        let mut tables = self.tables.write();
        let t = tables.get_mut(&row.table).ok_or_else(|| {
            StorageError::TableNotFound {
                table: row.table.to_string(),
            }
        })?;
        if let Some((col, _)) =
            row.values.iter().find(|(c, _)| t.schema.column(c).is_none())
        {
            return Err(StorageError::Rejected {
                details: format!("unknown column '{col}' in 'field list'").into(),
            });
        }

        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst) + 1;
        t.rows.push(MemRow {
            id,
            received_at: row.received_at,
            sensor_id: row.sensor_id.clone(),
            values: row.values.clone(),
        });
        debug!(storage = %self.id, table = %row.table, id, sensor_id = %row.sensor_id, "row stored");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleforge_core::ColumnType;

    fn schema() -> TableSchema {
        TableSchema::new(
            TableName::new("Sensoren_DHT11"),
            vec![ColumnSpec::new("temp", ColumnType::Numeric)],
        )
    }

    fn row(values: Vec<(String, SqlValue)>) -> RowInsert {
        RowInsert {
            table: TableName::new("Sensoren_DHT11"),
            received_at: Utc::now(),
            sensor_id: "S1".into(),
            values,
        }
    }

    #[tokio::test]
    async fn create_fails_if_exists() {
        let mem = MemStorage::new("mem");
        mem.create_table(&schema()).await.unwrap();
        let err = mem.create_table(&schema()).await.unwrap_err();
        assert!(matches!(err, StorageError::TableExists { .. }));
        assert_eq!(mem.create_calls(), 2);
    }

    #[tokio::test]
    async fn describe_missing_table_is_none() {
        let mem = MemStorage::new("mem");
        let probed = mem.describe_table(&TableName::new("nope")).await.unwrap();
        assert!(probed.is_none());
    }

    #[tokio::test]
    async fn insert_into_missing_table() {
        let mem = MemStorage::new("mem");
        let err = mem.insert_row(&row(vec![])).await.unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn insert_rejects_unknown_column() {
        let mem = MemStorage::new("mem");
        mem.create_table(&schema()).await.unwrap();
        let err = mem
            .insert_row(&row(vec![("humidity".into(), SqlValue::Int(55))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected { .. }));
        assert_eq!(mem.total_rows(), 0);
    }

    #[tokio::test]
    async fn rows_get_increasing_ids() {
        let mem = MemStorage::new("mem");
        mem.create_table(&schema()).await.unwrap();
        for t in [20.0, 21.0] {
            mem.insert_row(&row(vec![("temp".into(), SqlValue::Float(t))]))
                .await
                .unwrap();
        }
        let rows = mem.rows(&TableName::new("Sensoren_DHT11"));
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rows[1].value("temp"), Some(&SqlValue::Float(21.0)));
    }

    #[tokio::test]
    async fn add_columns_rejects_duplicates() {
        let mem = MemStorage::new("mem");
        mem.create_table(&schema()).await.unwrap();
        let table = TableName::new("Sensoren_DHT11");
        mem.add_columns(&table, &[ColumnSpec::new("rh", ColumnType::Numeric)])
            .await
            .unwrap();
        let err = mem
            .add_columns(&table, &[ColumnSpec::new("rh", ColumnType::Numeric)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ColumnExists { .. }));
        assert_eq!(
            mem.table_schema(&table).unwrap().column_names(),
            vec!["temp", "rh"]
        );
    }

    #[tokio::test]
    async fn unavailable_mode() {
        let mem = MemStorage::new("mem");
        mem.set_unavailable(true);
        assert!(matches!(
            mem.ping().await.unwrap_err(),
            StorageError::Unavailable { .. }
        ));
        mem.set_unavailable(false);
        mem.ping().await.unwrap();
    }
}
