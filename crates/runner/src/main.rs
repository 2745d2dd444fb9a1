use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use common::{RetryOutcome, RetryPolicy, retry_async};
use runner::IngestPipeline;
use sinks::build_storage;
use sources::build_source;
use teleforge_config::{PipelineSpec, load_from_path};
use teleforge_core::ArcDynStorage;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "teleforge", version, about = "MQTT telemetry to MySQL with on-the-fly table provisioning")]
struct Args {
    #[arg(short, long, env = "TELEFORGE_CONFIG")]
    config: String,
    #[arg(long, default_value = "0.0.0.0:9095")]
    metrics_addr: String,
    /// Log level or EnvFilter directive; RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = o11y::O11yConfig {
        logging: o11y::logging::Config {
            level: args.log_level.clone(),
            json: args.log_json,
            with_targets: false,
        },
        metrics: o11y::tf_metrics::Config { enable: true },
        install_panic_hook: true,
    };
    o11y::init_all(&cfg).context("init observability")?;

    let ps = load_pipeline_cfg(&args.config)?;
    let pipeline_name = ps.metadata.name.clone();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let storage = build_storage(&ps)
        .with_context(|| format!("build storage for {pipeline_name}"))?;
    wait_for_storage(&storage, &cancel).await?;

    let pipeline = Arc::new(IngestPipeline::new(
        &pipeline_name,
        storage.clone(),
        ps.spec.ingest.clone(),
    ));

    let source = build_source(&ps);
    let (tx, rx) = mpsc::channel(source.channel_capacity());
    let source_handle = source
        .start(tx, cancel.child_token())
        .await
        .context("connect to MQTT broker")?;

    let addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("metrics_addr must be host:port")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener on {addr}"))?;
    info!(%addr, "metrics listening");

    let app: Router = o11y::tf_metrics::router_with_metrics()
        .route("/health", get(|| async { "ok" }));
    let http_cancel = cancel.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    info!(pipeline = %pipeline_name, "pipeline running");
    pipeline.run(rx, cancel.clone()).await;

    cancel.cancel();
    source_handle.stop();
    let source_result = source_handle.join().await;
    if let Err(e) = &source_result {
        error!(error = %e, "source stopped with error");
    }
    if let Err(e) = http.await? {
        warn!(error = %e, "metrics server stopped with error");
    }

    info!(pipeline = %pipeline_name, "shutdown complete");
    source_result.context("mqtt source failed")
}

fn load_pipeline_cfg(path: &str) -> Result<PipelineSpec> {
    let spec = load_from_path(path)
        .with_context(|| format!("load pipeline spec from {path}"))?;
    info!(pipeline = %spec.metadata.name, "pipeline spec loaded");
    debug!(pipeline_spec = ?spec, "pipeline spec");
    Ok(spec)
}

/// Storage must answer before any message is accepted.
async fn wait_for_storage(
    storage: &ArcDynStorage,
    cancel: &CancellationToken,
) -> Result<()> {
    let policy = RetryPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(15),
        0.2,
        Some(5),
    );
    retry_async(
        |_| storage.ping(),
        |e| e.is_transient(),
        Duration::from_secs(10),
        policy,
        cancel,
        "storage_ping",
    )
    .await
    .map_err(|outcome| match outcome {
        RetryOutcome::Cancelled => anyhow::anyhow!("startup cancelled"),
        RetryOutcome::Timeout { action } => {
            anyhow::anyhow!("storage not reachable: timeout during {action}")
        }
        RetryOutcome::Exhausted { attempts, last_error } => anyhow::anyhow!(
            "storage not reachable after {attempts} attempts: {last_error}"
        ),
        RetryOutcome::Failed(e) => anyhow::anyhow!("storage rejected connection: {e}"),
    })?;

    info!(storage = %storage.id(), "storage reachable");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
        }
        cancel.cancel();
    });
}
