//! Per-message orchestration: decode, resolve, provision, write.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use schema_registry::SchemaRegistry;
use schema_sensing::checked_table_name;
use teleforge_config::{IngestCfg, SchemaEvolution};
use teleforge_core::{
    ArcDynStorage, IngestError, IngestResult, InboundMessage, Message,
    StorageError, TableName,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provisioner::TableProvisioner;
use crate::writer::RowWriter;

/// What happened to one message that was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub table: TableName,
    /// The table was created by this message.
    pub provisioned: bool,
    /// Columns added for this message under `add_columns` evolution.
    pub added_columns: Vec<String>,
    pub rows: u64,
}

pub struct IngestPipeline {
    name: String,
    cfg: IngestCfg,
    registry: Arc<SchemaRegistry>,
    provisioner: TableProvisioner,
    writer: RowWriter,
}

impl IngestPipeline {
    pub fn new(name: &str, storage: ArcDynStorage, cfg: IngestCfg) -> Self {
        let registry = Arc::new(SchemaRegistry::new(storage.clone()));
        Self::with_registry(name, storage, registry, cfg)
    }

    /// Build on an existing registry, e.g. one shared with other pipelines
    /// writing to the same storage.
    pub fn with_registry(
        name: &str,
        storage: ArcDynStorage,
        registry: Arc<SchemaRegistry>,
        cfg: IngestCfg,
    ) -> Self {
        Self {
            name: name.to_string(),
            provisioner: TableProvisioner::new(storage.clone(), name),
            writer: RowWriter::new(storage, cfg.text_overflow),
            registry,
            cfg,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Handle one message end to end. Errors mean the message was dropped.
    pub async fn handle(&self, inbound: InboundMessage) -> IngestResult<IngestOutcome> {
        let started = Instant::now();
        let res = self.handle_inner(&inbound).await;

        match &res {
            Ok(outcome) => {
                counter!("teleforge_messages_ingested_total", "pipeline" => self.name.clone())
                    .increment(1);
                histogram!("teleforge_ingest_latency_seconds", "pipeline" => self.name.clone())
                    .record(started.elapsed().as_secs_f64());
                debug!(
                    pipeline = %self.name,
                    topic = %inbound.topic,
                    table = %outcome.table,
                    provisioned = outcome.provisioned,
                    "message ingested"
                );
            }
            Err(e) => {
                counter!(
                    "teleforge_messages_dropped_total",
                    "pipeline" => self.name.clone(),
                    "reason" => e.kind()
                )
                .increment(1);
                warn!(
                    pipeline = %self.name,
                    topic = %inbound.topic,
                    kind = e.kind(),
                    error = %e,
                    "message dropped"
                );
            }
        }
        res
    }

    async fn handle_inner(&self, inbound: &InboundMessage) -> IngestResult<IngestOutcome> {
        let msg = Message::decode(inbound)?;
        let table = checked_table_name(&msg.topic)?;

        // Resolve and provision under the table's guard; write after release.
        let mut guard = self.registry.lock(&table).await;
        let (mut schema, provisioned) = match guard.schema().await? {
            Some(schema) => (schema, false),
            None => {
                let p = self.provisioner.provision(&mut guard, &msg.fields).await?;
                (p.schema, p.created)
            }
        };

        let mut added_columns = Vec::new();
        if self.cfg.schema_evolution == SchemaEvolution::AddColumns {
            let missing: Vec<_> =
                TableProvisioner::derive_columns(&table, &msg.fields)?
                    .into_iter()
                    .filter(|c| schema.column(&c.name).is_none())
                    .collect();
            if !missing.is_empty() {
                schema = self
                    .provisioner
                    .add_columns(&mut guard, &schema, &missing)
                    .await?;
                added_columns = missing.into_iter().map(|c| c.name).collect();
            }
        }
        drop(guard);

        match self.writer.insert(&schema, &msg).await {
            Ok(rows) => Ok(IngestOutcome {
                table,
                provisioned,
                added_columns,
                rows,
            }),
            Err(IngestError::Storage(StorageError::TableNotFound { table: t })) => {
                self.registry.invalidate(&table).await;
                Err(IngestError::Storage(StorageError::TableNotFound { table: t }))
            }
            Err(e) => Err(e),
        }
    }

    /// Consume `rx` until it closes or `cancel` fires.
    ///
    /// With `max_inflight == 1` messages are handled strictly in arrival
    /// order. Larger values handle up to that many messages at once.
    pub async fn run(
        self: Arc<Self>,
        rx: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        info!(pipeline = %self.name, max_inflight = self.cfg.max_inflight, "ingest pipeline starting");
        if self.cfg.max_inflight <= 1 {
            self.run_sequential(rx, cancel).await;
        } else {
            self.clone().run_concurrent(rx, cancel).await;
        }
        info!(pipeline = %self.name, "ingest pipeline stopped");
    }

    async fn run_sequential(
        &self,
        mut rx: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                m = rx.recv() => m,
            };
            let Some(msg) = msg else { break };
            // Failures are already counted and logged.
            let _ = self.handle(msg).await;
        }
    }

    async fn run_concurrent(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.cfg.max_inflight));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(done) = tasks.try_join_next() {
                report_join(&self.name, done);
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                m = rx.recv() => m,
            };
            let Some(msg) = msg else { break };

            let this = self.clone();
            tasks.spawn(async move {
                let _ = this.handle(msg).await;
                drop(permit);
            });
        }

        while let Some(done) = tasks.join_next().await {
            report_join(&self.name, done);
        }
    }
}

fn report_join(pipeline: &str, res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!(pipeline, error = %e, "message handler task failed");
    }
}
