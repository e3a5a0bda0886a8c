//! Configuration management
//!
//! Serde-backed configuration with defaults, validation, and a couple
//! of environment overrides. Durations are human-readable in config
//! files ("60s", "100ms") via `humantime_serde`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_kvstore::rate_limiter::FloodRate;
use crate::logging::LogLevel;

/// Main store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this node, unique in the routing domain
    pub node_id: String,

    /// Areas this node participates in; at least one
    pub areas: Vec<AreaConfig>,

    /// Default lifetime for keys written by this node
    #[serde(with = "humantime_serde")]
    pub key_ttl: Duration,

    /// Cadence of the periodic anti-entropy full sync per area
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// TTL subtracted from every value on each forwarded hop
    #[serde(with = "humantime_serde")]
    pub ttl_decrement: Duration,

    /// Flood rate limit; absent means unlimited
    pub flood_rate: Option<FloodRate>,

    /// Restrict flooding to per-root spanning trees
    pub enable_flood_optimization: bool,

    /// Declare this node a flood root
    pub is_flood_root: bool,

    /// Bound on every command and inbound queue
    pub queue_capacity: usize,

    /// Deadline applied to public store operations
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,

    /// IP type-of-service value handed to the transport, if any
    pub ip_tos: Option<u8>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Per-area settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Area identifier
    pub area_id: String,

    /// Import policy: key prefixes accepted into this area; empty accepts all
    #[serde(default)]
    pub key_prefix_filters: Vec<String>,

    /// Import policy: originators accepted into this area; empty accepts all
    #[serde(default)]
    pub originator_id_filters: BTreeSet<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level to emit
    pub level: LogLevel,

    /// Emit JSON instead of the human-readable format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: LogLevel::Info, json_format: false }
    }
}

impl From<&LoggingConfig> for crate::logging::LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        crate::logging::LogConfig::new(config.level).json_format(config.json_format)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: "node".to_string(),
            areas: vec![AreaConfig {
                area_id: "0".to_string(),
                key_prefix_filters: Vec::new(),
                originator_id_filters: BTreeSet::new(),
            }],
            key_ttl: Duration::from_secs(300),
            sync_interval: Duration::from_secs(60),
            ttl_decrement: Duration::from_millis(1),
            flood_rate: None,
            enable_flood_optimization: false,
            is_flood_root: false,
            queue_capacity: 1024,
            op_timeout: Duration::from_secs(10),
            ip_tos: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Defaults plus environment overrides:
    /// `FLOODKV_NODE_ID` and `FLOODKV_LOG_LEVEL`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Ok(node_id) = env::var("FLOODKV_NODE_ID") {
            config.node_id = node_id;
        }
        if let Ok(level) = env::var("FLOODKV_LOG_LEVEL") {
            config.logging.level = level
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: level,
                })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config document and validate it
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingField("node_id".to_string()));
        }
        if self.areas.is_empty() {
            return Err(ConfigError::MissingField("areas".to_string()));
        }
        let mut seen = BTreeSet::new();
        for area in &self.areas {
            if area.area_id.is_empty() {
                return Err(ConfigError::MissingField("areas[].area_id".to_string()));
            }
            if !seen.insert(&area.area_id) {
                return Err(ConfigError::InvalidValue {
                    field: "areas".to_string(),
                    value: format!("duplicate area {}", area.area_id),
                });
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(rate) = &self.flood_rate {
            if rate.flood_msg_per_sec <= 0.0 || rate.flood_msg_burst_size < 1.0 {
                return Err(ConfigError::InvalidValue {
                    field: "flood_rate".to_string(),
                    value: format!("{rate:?}"),
                });
            }
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "op_timeout".to_string(),
                value: "0".to_string(),
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sync_interval".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
