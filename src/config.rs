//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderName;

use crate::error::{GatekeeperError, Result};
use crate::web::{ForwardedFor, HeaderKey, KeyExtractor, PeerAddr};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__ADMISSION__WINDOW_MS`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission filter configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// How the client key is derived from an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Socket peer address (not proxy-aware)
    #[default]
    PeerAddr,
    /// `X-Forwarded-For` / `X-Real-IP`, falling back to the peer address
    ForwardedFor,
    /// Value of an arbitrary request header
    Header { name: String },
}

/// Admission filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Minimum interval between admitted requests from one client, in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Client key extraction strategy
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub client_key: KeyStrategy,

    /// Idle-record eviction. Disabled unless configured.
    #[serde(default)]
    pub eviction: Option<EvictionConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            client_key: KeyStrategy::default(),
            eviction: None,
        }
    }
}

fn default_window_ms() -> u64 {
    1000
}

/// Background sweep of admission records that can no longer affect a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// How often the sweeper runs, in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Records idle for at least this long are removed, in seconds
    #[serde(default = "default_idle_after")]
    pub idle_after_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_after() -> u64 {
    300
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AdmissionConfig {
    /// The admission window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Build the key extractor selected by `client_key`.
    pub fn key_extractor(&self) -> Result<Arc<dyn KeyExtractor>> {
        let extractor: Arc<dyn KeyExtractor> = match &self.client_key {
            KeyStrategy::PeerAddr => Arc::new(PeerAddr),
            KeyStrategy::ForwardedFor => Arc::new(ForwardedFor),
            KeyStrategy::Header { name } => Arc::new(HeaderKey::new(parse_header_name(name)?)),
        };
        Ok(extractor)
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::try_from(name)
        .map_err(|e| GatekeeperError::Config(format!("invalid client key header {:?}: {}", name, e)))
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, layered with
    /// `GATEKEEPER__<SECTION>__<FIELD>` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GatekeeperConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot validate on its own.
    pub fn validate(&self) -> Result<()> {
        if let KeyStrategy::Header { name } = &self.admission.client_key {
            parse_header_name(name)?;
        }
        if let Some(eviction) = &self.admission.eviction {
            if eviction.interval_secs == 0 {
                return Err(GatekeeperError::Config(
                    "admission.eviction.interval_secs must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}
