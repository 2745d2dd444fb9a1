//! Transport subscribers.
//!
//! A source connects to the broker, subscribes, and forwards every
//! publish as an [`InboundMessage`](teleforge_core::InboundMessage) on a
//! bounded channel. The pipeline owns the receiving end.

use std::borrow::Cow;

use anyhow::anyhow;
use teleforge_config::{PipelineSpec, SourceCfg};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod mqtt;

pub use mqtt::MqttSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("timeout during {action}")]
    Timeout { action: Cow<'static, str> },

    #[error("connection error: {details}")]
    Connect { details: Cow<'static, str> },

    #[error("authentication error: {details}")]
    Auth { details: Cow<'static, str> },

    #[error("incompatible configuration: {details}")]
    Incompatible { details: Cow<'static, str> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Control handle for a running source.
pub struct SourceHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<SourceResult<()>>,
}

impl SourceHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the source task to complete.
    pub async fn join(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(r) => Ok(r?),
            Err(e) => Err(anyhow!("source task panicked: {e}")),
        }
    }
}

/// Build the transport subscriber named by the pipeline spec.
pub fn build_source(pipeline: &PipelineSpec) -> MqttSource {
    match &pipeline.spec.source {
        SourceCfg::Mqtt(c) => MqttSource::new(c.clone(), &pipeline.metadata.name),
    }
}
