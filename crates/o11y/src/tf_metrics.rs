use axum::{Router, routing::get};
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct Config {
    pub enable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Install the Prometheus recorder. The snapshot is served by
/// [`router_with_metrics`].
pub fn init(cfg: &Config) -> anyhow::Result<()> {
    if !cfg.enable {
        return Ok(());
    }

    HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("failed to install recorder: {e}"))
    })?;

    describe_metrics();
    Ok(())
}

/// Axum handler that renders the current metrics snapshot.
pub async fn metrics_handler() -> String {
    HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_else(|| "# recorder not installed\n".into())
}

pub fn router_with_metrics() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub fn describe_metrics() {
    describe_counter!(
        "teleforge_messages_received_total",
        Unit::Count,
        "Publishes received from the broker"
    );
    describe_counter!(
        "teleforge_messages_ingested_total",
        Unit::Count,
        "Messages written as a row"
    );
    describe_counter!(
        "teleforge_messages_dropped_total",
        Unit::Count,
        "Messages dropped, by reason"
    );
    describe_counter!(
        "teleforge_tables_created_total",
        Unit::Count,
        "Tables created on first sight of a topic"
    );
    describe_counter!(
        "teleforge_columns_added_total",
        Unit::Count,
        "Columns added to existing tables"
    );
    describe_counter!(
        "teleforge_source_reconnects_total",
        Unit::Count,
        "Reconnects performed by the broker client"
    );
    describe_counter!(
        "teleforge_panics_total",
        Unit::Count,
        "Panics captured by the panic hook"
    );
    describe_histogram!(
        "teleforge_ingest_latency_seconds",
        Unit::Seconds,
        "Time to handle one message, decode to insert"
    );
}
