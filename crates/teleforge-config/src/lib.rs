use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("expanding environment in {path}: {details}")]
    Env { path: String, details: String },

    #[error("parsing yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub metadata: Metadata,
    pub spec: Spec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Pipeline name, used in logs and as the default MQTT client id.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub source: SourceCfg,
    pub storage: StorageCfg,
    #[serde(default)]
    pub ingest: IngestCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum SourceCfg {
    Mqtt(MqttSourceCfg),
}

/// MQTT subscriber configuration.
///
/// # Example
///
/// ```yaml
/// source:
///   type: mqtt
///   config:
///     id: broker
///     host: ${MQTT_BROKER_HOST}
///     port: ${MQTT_BROKER_PORT:-1883}
///     username: ${MQTT_USER:-}
///     password: ${MQTT_PASSWORD:-}
///     tls: false
///     subscription: "Sensoren/#"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSourceCfg {
    pub id: String,

    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Defaults to `teleforge-<pipeline name>-<id>`.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Credentials are only applied when both are non-empty.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// TLS using the platform root certificates.
    #[serde(default)]
    pub tls: bool,

    /// Topic filter, wildcards allowed.
    pub subscription: String,

    /// 0, 1 or 2. Default: 0
    #[serde(default)]
    pub qos: u8,

    /// Default: 30
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,

    /// Timeout for the initial connection (seconds). Default: 15
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Capacity of the channel between subscriber and pipeline. Default: 1024
    #[serde(default)]
    pub channel_capacity: Option<usize>,
}

impl MqttSourceCfg {
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn client_id(&self, pipeline: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("teleforge-{pipeline}-{}", self.id))
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_KEEP_ALIVE)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(Self::DEFAULT_CHANNEL_CAPACITY)
    }

    /// `(user, password)` when both are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum StorageCfg {
    Mysql(MySqlStorageCfg),
    /// In-process tables, nothing persisted. Useful for dry runs.
    Memory(MemoryStorageCfg),
}

/// MySQL / MariaDB storage configuration.
///
/// # Example
///
/// ```yaml
/// storage:
///   type: mysql
///   config:
///     id: mariadb
///     dsn: mysql://${DB_HOST}:${DB_PORT}/${DB_NAME}
///     user: ${DB_USER}
///     password: '${DB_PASSWORD}'
///     max_connections: 8
///     op_timeout_secs: 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlStorageCfg {
    pub id: String,

    pub dsn: String,

    /// Override the DSN's user. Taken verbatim, no percent-encoding.
    #[serde(default)]
    pub user: Option<String>,

    /// Override the DSN's password. Taken verbatim, no percent-encoding.
    #[serde(default)]
    pub password: Option<String>,

    /// Upper bound of the connection pool. Default: 10
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Timeout per storage operation (seconds). Default: 10
    #[serde(default)]
    pub op_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageCfg {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestCfg {
    /// Messages handled concurrently. 1 keeps strict arrival order.
    pub max_inflight: usize,

    pub text_overflow: TextOverflow,

    pub schema_evolution: SchemaEvolution,
}

impl Default for IngestCfg {
    fn default() -> Self {
        Self {
            max_inflight: 1,
            text_overflow: TextOverflow::default(),
            schema_evolution: SchemaEvolution::default(),
        }
    }
}

/// What to do with a string longer than its column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOverflow {
    /// Drop the message with `ValueTooLong`.
    #[default]
    Reject,
    /// Cut the value to the column length.
    Truncate,
}

/// What to do with payload keys that have no column yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaEvolution {
    /// Drop the message with `UnknownColumn`.
    #[default]
    Reject,
    /// Add the missing columns, then insert.
    AddColumns,
}

impl PipelineSpec {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(ConfigError::Invalid("metadata.name is empty".into()));
        }

        match &self.spec.source {
            SourceCfg::Mqtt(c) => {
                if c.host.trim().is_empty() {
                    return Err(ConfigError::Invalid("mqtt host is empty".into()));
                }
                if c.subscription.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "mqtt subscription is empty".into(),
                    ));
                }
                if c.qos > 2 {
                    return Err(ConfigError::Invalid(format!(
                        "mqtt qos must be 0, 1 or 2, got {}",
                        c.qos
                    )));
                }
            }
        }

        if let StorageCfg::Mysql(c) = &self.spec.storage {
            if c.dsn.trim().is_empty() {
                return Err(ConfigError::Invalid("mysql dsn is empty".into()));
            }
            if c.max_connections == Some(0) {
                return Err(ConfigError::Invalid(
                    "mysql max_connections must be at least 1".into(),
                ));
            }
        }

        if self.spec.ingest.max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "ingest.max_inflight must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Parse a pipeline spec from YAML text, expanding `${VAR}` and
/// `${VAR:-default}` from the process environment first.
pub fn load_from_str(raw: &str, origin: &str) -> ConfigResult<PipelineSpec> {
    let with_env = shellexpand::env(raw).map_err(|e| ConfigError::Env {
        path: origin.to_string(),
        details: e.to_string(),
    })?;
    let spec: PipelineSpec = serde_yaml::from_str(&with_env)?;
    spec.validate()?;
    Ok(spec)
}

pub fn load_from_path(file_path: &str) -> ConfigResult<PipelineSpec> {
    let raw = fs::read_to_string(file_path).map_err(|source| ConfigError::Io {
        path: file_path.to_string(),
        source,
    })?;
    let spec = load_from_str(&raw, file_path)?;
    debug!(path = %file_path, pipeline = %spec.metadata.name, "pipeline spec loaded");
    Ok(spec)
}
