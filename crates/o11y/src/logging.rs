use once_cell::sync::OnceCell;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt,
};

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct Config {
    /// Either a simple level like "info" or a full EnvFilter string
    /// e.g. "info,runner=debug,rumqttc=warn". `RUST_LOG` wins when set.
    pub level: Option<String>,
    /// Emit logs as JSON lines when true; otherwise text.
    pub json: bool,
    /// Include the event target in logs.
    pub with_targets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: Some("info".to_owned()),
            json: false,
            with_targets: false,
        }
    }
}

pub(crate) fn filter_for(cfg: &Config) -> EnvFilter {
    let level = cfg.level.clone().unwrap_or_else(|| "info".into());
    EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(cfg: &Config) -> anyhow::Result<()> {
    INIT.get_or_try_init(|| {
        let _ = LogTracer::init();

        let fmt_layer = if cfg.json {
            fmt::layer()
                .with_target(cfg.with_targets)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(cfg.with_targets)
                .with_ansi(true)
                .boxed()
        };

        let subscriber =
            Registry::default().with(filter_for(cfg)).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            anyhow::anyhow!("failed to set global tracing subscriber: {e}")
        })
    })?;
    Ok(())
}
