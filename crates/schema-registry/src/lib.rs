//! Schema registry.
//!
//! Remembers, per table name, whether the table exists and which derived
//! columns it has. Knowledge is filled lazily by probing storage and is
//! updated by the provisioner after it creates or extends a table.
//!
//! All reads and writes of one table's entry go through a [`TableGuard`],
//! which holds that table's async mutex. Holding the guard across
//! "probe, then create" makes the check-then-act sequence atomic within
//! the process. Guards for different tables never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use teleforge_core::{ArcDynStorage, StorageResult, TableName, TableSchema};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// What the process knows about one table.
#[derive(Debug, Clone, Default)]
pub enum TableState {
    /// Never probed, or invalidated.
    #[default]
    Unknown,
    /// Probed and absent.
    Missing,
    Present(Arc<TableSchema>),
}

type Slot = Arc<AsyncMutex<TableState>>;

pub struct SchemaRegistry {
    storage: ArcDynStorage,
    slots: Mutex<HashMap<TableName, Slot>>,
}

impl SchemaRegistry {
    pub fn new(storage: ArcDynStorage) -> Self {
        Self {
            storage,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, table: &TableName) -> Slot {
        self.slots
            .lock()
            .entry(table.clone())
            .or_default()
            .clone()
    }

    /// Enter the critical section for `table`. Waits while another handler
    /// holds it.
    pub async fn lock(&self, table: &TableName) -> TableGuard {
        let state = self.slot(table).lock_owned().await;
        TableGuard {
            table: table.clone(),
            state,
            storage: self.storage.clone(),
        }
    }

    /// Whether `table` exists, probing storage on a cache miss.
    pub async fn exists(&self, table: &TableName) -> StorageResult<bool> {
        self.lock(table).await.exists().await
    }

    /// Mark a freshly created table as present.
    pub async fn record_created(&self, schema: TableSchema) -> Arc<TableSchema> {
        let table = schema.name.clone();
        self.lock(&table).await.record_created(schema)
    }

    /// Forget what is known about `table`; the next check re-probes.
    pub async fn invalidate(&self, table: &TableName) {
        self.lock(table).await.invalidate();
    }

    /// Cached schema, without probing.
    pub async fn cached(&self, table: &TableName) -> Option<Arc<TableSchema>> {
        let slot = self.slots.lock().get(table).cloned()?;
        let state = slot.lock().await;
        match &*state {
            TableState::Present(schema) => Some(schema.clone()),
            TableState::Unknown | TableState::Missing => None,
        }
    }

    /// Tables currently known to exist, sorted by name.
    pub async fn known_tables(&self) -> Vec<TableName> {
        let slots: Vec<(TableName, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut known = Vec::new();
        for (name, slot) in slots {
            if matches!(&*slot.lock().await, TableState::Present(_)) {
                known.push(name);
            }
        }
        known.sort();
        known
    }
}

/// Exclusive access to one table's registry entry.
pub struct TableGuard {
    table: TableName,
    state: OwnedMutexGuard<TableState>,
    storage: ArcDynStorage,
}

impl TableGuard {
    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Known schema, probing storage if nothing is cached.
    ///
    /// Probe failures propagate and leave the entry `Unknown`.
    pub async fn schema(&mut self) -> StorageResult<Option<Arc<TableSchema>>> {
        match &*self.state {
            TableState::Present(schema) => return Ok(Some(schema.clone())),
            TableState::Missing => return Ok(None),
            TableState::Unknown => {}
        }

        let probed = self.storage.describe_table(&self.table).await?;
        debug!(table = %self.table, found = probed.is_some(), "probed table");

        *self.state = match probed {
            Some(schema) => TableState::Present(Arc::new(schema)),
            None => TableState::Missing,
        };
        Ok(match &*self.state {
            TableState::Present(schema) => Some(schema.clone()),
            TableState::Unknown | TableState::Missing => None,
        })
    }

    pub async fn exists(&mut self) -> StorageResult<bool> {
        Ok(self.schema().await?.is_some())
    }

    pub fn record_created(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        debug!(table = %self.table, columns = schema.columns.len(), "recording created table");
        self.replace(schema)
    }

    /// Replace the cached schema after columns were added.
    pub fn record_extended(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        debug!(table = %self.table, columns = schema.columns.len(), "recording extended table");
        self.replace(schema)
    }

    pub fn invalidate(&mut self) {
        debug!(table = %self.table, "invalidating registry entry");
        *self.state = TableState::Unknown;
    }

    fn replace(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        *self.state = TableState::Present(schema.clone());
        schema
    }
}
