use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::models::App;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub adapter: AdapterConfig,
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity of this node inside the cluster. Generated at startup when unset.
    pub node_id: Option<String>,
    /// How long the drain procedure waits for sockets to flush their close frames
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            shutdown_grace_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Which registry/transport combination backs the adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterDriver {
    /// Single process, no coordination
    #[default]
    Local,
    /// In-process discovery group
    Cluster,
    Redis,
    Nats,
}

impl std::fmt::Display for AdapterDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Cluster => "cluster",
            Self::Redis => "redis",
            Self::Nats => "nats",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub driver: AdapterDriver,
    pub redis: RedisAdapterConfig,
    pub nats: NatsAdapterConfig,
    pub cluster: ClusterAdapterConfig,
}

impl AdapterConfig {
    /// Scatter-gather timeout of the selected driver
    #[must_use]
    pub fn requests_timeout(&self) -> Duration {
        let ms = match self.driver {
            AdapterDriver::Local => 0,
            AdapterDriver::Cluster => self.cluster.requests_timeout_ms,
            AdapterDriver::Redis => self.redis.requests_timeout_ms,
            AdapterDriver::Nats => self.nats.requests_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisAdapterConfig {
    pub url: String,
    pub prefix: String,
    pub requests_timeout_ms: u64,
    /// Sum subscriber counts over `cluster_nodes` instead of asking `url` alone
    pub cluster_mode: bool,
    pub cluster_nodes: Vec<String>,
}

impl Default for RedisAdapterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: String::new(),
            requests_timeout_ms: 5000,
            cluster_mode: false,
            cluster_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsAdapterConfig {
    pub servers: Vec<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub prefix: String,
    pub requests_timeout_ms: u64,
    /// Connect timeout
    pub timeout_ms: u64,
    /// Static node count. When zero the count is estimated from server introspection.
    pub nodes_number: usize,
}

impl Default for NatsAdapterConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            user: None,
            pass: None,
            token: None,
            prefix: String::new(),
            requests_timeout_ms: 5000,
            timeout_ms: 10_000,
            nodes_number: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterAdapterConfig {
    pub prefix: String,
    pub requests_timeout_ms: u64,
}

impl Default for ClusterAdapterConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            requests_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`PUSHLINE_ADAPTER__DRIVER=redis`)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PUSHLINE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("adapter.redis.cluster_nodes")
                .with_list_parse_key("adapter.nats.servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Look up the limits of a tenant, falling back to defaults for unknown ids
    #[must_use]
    pub fn app(&self, app_id: &str) -> App {
        self.apps
            .iter()
            .find(|app| app.id == app_id)
            .cloned()
            .unwrap_or_else(|| App::with_id(app_id))
    }

    /// Collect every configuration problem instead of stopping at the first one
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.adapter.driver {
            AdapterDriver::Local => {}
            AdapterDriver::Redis => {
                if self.adapter.redis.cluster_mode {
                    if self.adapter.redis.cluster_nodes.is_empty() {
                        errors.push("adapter.redis.cluster_nodes is empty while cluster_mode is on".to_string());
                    }
                } else if self.adapter.redis.url.is_empty() {
                    errors.push("adapter.redis.url is required for the redis driver".to_string());
                }
            }
            AdapterDriver::Nats => {
                if self.adapter.nats.servers.is_empty() {
                    errors.push("adapter.nats.servers is required for the nats driver".to_string());
                }
            }
            AdapterDriver::Cluster => {}
        }

        if self.adapter.driver != AdapterDriver::Local && self.adapter.requests_timeout().is_zero() {
            errors.push(format!(
                "adapter.{}.requests_timeout_ms must be greater than zero",
                self.adapter.driver
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format must be json or pretty, got {}", self.logging.format));
        }

        for app in &self.apps {
            if app.id.is_empty() {
                errors.push("apps[].id must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
