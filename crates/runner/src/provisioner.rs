//! First-sight table creation and additive column changes.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use schema_registry::TableGuard;
use schema_sensing::{checked_column_name, infer_type};
use teleforge_core::{
    ArcDynStorage, ColumnSpec, Fields, IngestError, IngestResult, StorageError,
    TableName, TableSchema,
};
use tracing::{info, warn};

/// Result of [`TableProvisioner::provision`].
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub schema: Arc<TableSchema>,
    /// False when another writer created the table first.
    pub created: bool,
}

pub struct TableProvisioner {
    storage: ArcDynStorage,
    pipeline: String,
}

impl TableProvisioner {
    pub fn new(storage: ArcDynStorage, pipeline: &str) -> Self {
        Self {
            storage,
            pipeline: pipeline.to_string(),
        }
    }

    /// One column per key of `fields`, in key order.
    ///
    /// Two keys sanitizing to the same column are a `SchemaConflict`.
    pub fn derive_columns(
        table: &TableName,
        fields: &Fields,
    ) -> IngestResult<Vec<ColumnSpec>> {
        let mut seen = HashSet::with_capacity(fields.len());
        let mut columns = Vec::with_capacity(fields.len());

        for (key, value) in fields {
            let name = checked_column_name(table, key)?;
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(IngestError::SchemaConflict {
                    table: table.to_string(),
                    column: name,
                    reason: format!("key {key:?} maps to a column already derived from another key").into(),
                });
            }
            columns.push(ColumnSpec::new(name, infer_type(value)));
        }
        Ok(columns)
    }

    /// Create the guarded table from `sample`.
    ///
    /// Losing a creation race to another writer is not an error: the
    /// entry is re-probed and the winner's schema is returned.
    pub async fn provision(
        &self,
        guard: &mut TableGuard,
        sample: &Fields,
    ) -> IngestResult<Provisioned> {
        let columns = Self::derive_columns(guard.table(), sample)?;
        let schema = TableSchema::new(guard.table().clone(), columns);

        match self.storage.create_table(&schema).await {
            Ok(()) => {
                counter!(
                    "teleforge_tables_created_total",
                    "pipeline" => self.pipeline.clone()
                )
                .increment(1);
                info!(
                    pipeline = %self.pipeline,
                    table = %schema.name,
                    columns = ?schema.column_names(),
                    "table created"
                );
                Ok(Provisioned {
                    schema: guard.record_created(schema),
                    created: true,
                })
            }
            Err(StorageError::TableExists { .. }) => {
                info!(pipeline = %self.pipeline, table = %guard.table(), "table created concurrently, re-probing");
                let schema = self.reprobe(guard).await?;
                Ok(Provisioned {
                    schema,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add `columns` to the guarded table, whose known schema is `current`.
    pub async fn add_columns(
        &self,
        guard: &mut TableGuard,
        current: &TableSchema,
        columns: &[ColumnSpec],
    ) -> IngestResult<Arc<TableSchema>> {
        match self.storage.add_columns(guard.table(), columns).await {
            Ok(()) => {
                counter!(
                    "teleforge_columns_added_total",
                    "pipeline" => self.pipeline.clone()
                )
                .increment(columns.len() as u64);
                info!(
                    pipeline = %self.pipeline,
                    table = %guard.table(),
                    added = ?columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "columns added"
                );
                Ok(guard.record_extended(current.extended(columns)))
            }
            Err(StorageError::ColumnExists { details, .. }) => {
                warn!(pipeline = %self.pipeline, table = %guard.table(), %details, "columns added concurrently, re-probing");
                self.reprobe(guard).await
            }
            Err(e @ StorageError::TableNotFound { .. }) => {
                warn!(pipeline = %self.pipeline, table = %guard.table(), "table vanished, dropping cached schema");
                guard.invalidate();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reprobe(&self, guard: &mut TableGuard) -> IngestResult<Arc<TableSchema>> {
        guard.invalidate();
        guard.schema().await?.ok_or_else(|| {
            IngestError::Storage(StorageError::TableNotFound {
                table: guard.table().to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use schema_registry::SchemaRegistry;
    use serde_json::json;
    use sinks::MemStorage;
    use teleforge_core::{ColumnType, Storage};

    fn fields(v: serde_json::Value) -> Fields {
        match v {
            serde_json::Value::Object(m) => m,
            _ => unreachable!("test fixture must be an object"),
        }
    }

    #[test]
    fn derives_in_key_order_with_inferred_types() {
        let t = TableName::new("t");
        let cols = TableProvisioner::derive_columns(
            &t,
            &fields(json!({"temp": 21.5, "battery.level": 3, "status": "ok", "tags": [1]})),
        )
        .unwrap();
        assert_eq!(
            cols,
            vec![
                ColumnSpec::new("temp", ColumnType::Numeric),
                ColumnSpec::new("battery_level", ColumnType::Numeric),
                ColumnSpec::new("status", ColumnType::Text),
                ColumnSpec::new("tags", ColumnType::Opaque),
            ]
        );
    }

    #[test]
    fn colliding_keys_conflict() {
        let t = TableName::new("t");
        let err = TableProvisioner::derive_columns(&t, &fields(json!({"a.b": 1, "a-b": 2})))
            .unwrap_err();
        assert_eq!(err.kind(), "schema_conflict");

        let err = TableProvisioner::derive_columns(&t, &fields(json!({"timestamp": 1})))
            .unwrap_err();
        assert_eq!(err.kind(), "schema_conflict");
    }

    #[tokio::test]
    async fn lost_race_returns_existing_schema() {
        let mem = Arc::new(MemStorage::new("mem"));
        let winner = TableSchema::new(
            TableName::new("t"),
            vec![ColumnSpec::new("temp", ColumnType::Numeric)],
        );
        mem.create_table(&winner).await.unwrap();

        let reg = SchemaRegistry::new(mem.clone());
        let prov = TableProvisioner::new(mem.clone(), "p");
        let mut guard = reg.lock(&TableName::new("t")).await;

        let out = prov
            .provision(&mut guard, &fields(json!({"humidity": 50})))
            .await
            .unwrap();
        assert!(!out.created);
        assert_eq!(out.schema.column_names(), vec!["temp"]);
        assert_eq!(mem.create_calls(), 2);
    }

    #[tokio::test]
    async fn duplicate_column_returns_reprobed_schema() {
        let mem = Arc::new(MemStorage::new("mem"));
        let table = TableName::new("t");
        mem.create_table(&TableSchema::new(
            table.clone(),
            vec![ColumnSpec::new("temp", ColumnType::Numeric)],
        ))
        .await
        .unwrap();

        let reg = SchemaRegistry::new(mem.clone());
        let prov = TableProvisioner::new(mem.clone(), "p");
        let mut guard = reg.lock(&table).await;
        let current = guard.schema().await.unwrap().unwrap();

        // Another writer adds the column after our probe.
        let humidity = ColumnSpec::new("humidity", ColumnType::Numeric);
        mem.add_columns(&table, std::slice::from_ref(&humidity))
            .await
            .unwrap();

        let schema = prov
            .add_columns(&mut guard, &current, &[humidity])
            .await
            .unwrap();
        assert_eq!(schema.column_names(), vec!["temp", "humidity"]);
        assert_eq!(
            guard.schema().await.unwrap().unwrap().column_names(),
            vec!["temp", "humidity"]
        );
    }

    #[tokio::test]
    async fn add_columns_on_dropped_table_forgets_schema() {
        let mem = Arc::new(MemStorage::new("mem"));
        let table = TableName::new("t");
        mem.create_table(&TableSchema::new(
            table.clone(),
            vec![ColumnSpec::new("temp", ColumnType::Numeric)],
        ))
        .await
        .unwrap();

        let reg = SchemaRegistry::new(mem.clone());
        let prov = TableProvisioner::new(mem.clone(), "p");
        let mut guard = reg.lock(&table).await;
        let current = guard.schema().await.unwrap().unwrap();
        assert!(mem.drop_table(&table));

        let err = prov
            .add_columns(
                &mut guard,
                &current,
                &[ColumnSpec::new("humidity", ColumnType::Numeric)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(matches!(guard.state(), schema_registry::TableState::Unknown));
    }

    #[tokio::test]
    async fn storage_failure_surfaces() {
        let mem = Arc::new(MemStorage::new("mem"));
        mem.set_unavailable(true);
        let reg = SchemaRegistry::new(mem.clone());
        let prov = TableProvisioner::new(mem.clone(), "p");
        let mut guard = reg.lock(&TableName::new("t")).await;

        let err = prov
            .provision(&mut guard, &fields(json!({"temp": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage_unavailable");
    }
}
