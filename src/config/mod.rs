//! Configuration Module
//!
//! Flat key/value configuration for a channel, with layered fallback:
//! - Built-in defaults
//! - Environment variable overrides (`VIBEMESH__<KEY>`)
//! - An explicit map supplied by the caller (wins over everything)
//!
//! Durations are human readable (`"500ms"`, `"5s"`).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use config::Environment;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::node::NodeId;
use crate::transport::TransportKind;


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Settings of one channel
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Logical namespace shared by the nodes that should find each other
    pub domain: String,
    /// Fixed node id; generated from the hostname when unset
    pub node_id: Option<String>,

    /// Silence after which a peer becomes suspect
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Failure detector tick
    #[serde(with = "humantime_serde")]
    pub control_interval: Duration,

    pub gossip_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round
    pub gossip_node_count: usize,

    /// Peers asked to probe a suspect on our behalf
    pub health_check_delegate_count: usize,
    #[serde(with = "humantime_serde")]
    pub health_check_delegate_timeout: Duration,

    /// Maximum targets (or gossip entries) per control batch
    pub control_batch_size: usize,

    pub publish_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub publish_interval_min: Duration,
    #[serde(with = "humantime_serde")]
    pub publish_interval_max: Duration,

    /// Jitter before the first failure detector tick
    #[serde(with = "humantime_serde")]
    pub start_delay_min: Duration,
    #[serde(with = "humantime_serde")]
    pub start_delay_max: Duration,

    pub auto_broadcast_enabled: bool,
    /// Live peer count at or below which the full view is broadcast;
    /// 0 disables
    pub auto_broadcast_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub auto_broadcast_interval: Duration,

    /// Concurrent outbound connections per peer
    pub max_client_connections: usize,
    /// How long a dead peer stays tombstoned
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    pub consumer_workers: usize,
    pub consumer_queue_capacity: usize,
    pub publish_workers: usize,
    pub publish_queue_capacity: usize,

    /// Allow `ChannelRegistry::get_or_create` to hand out an existing channel
    pub reuse_channels: bool,

    pub broadcast_provider: TransportKind,
    pub unicast_provider: TransportKind,
    pub unicast_bind: SocketAddr,
    pub unicast_advertise: Option<SocketAddr>,
    pub broadcast_group: SocketAddr,
    pub broadcast_interface: Ipv4Addr,
    pub multicast_ttl: u32,

    /// Default `tracing` filter for [`ChannelConfig::init_logging`]
    pub log_level: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            node_id: None,
            heartbeat_timeout: Duration::from_secs(5),
            control_interval: Duration::from_secs(1),
            gossip_enabled: true,
            gossip_interval: Duration::from_secs(1),
            gossip_node_count: 3,
            health_check_delegate_count: 3,
            health_check_delegate_timeout: Duration::from_secs(1),
            control_batch_size: 32,
            publish_max_attempts: 3,
            publish_interval_min: Duration::from_millis(200),
            publish_interval_max: Duration::from_secs(1),
            start_delay_min: Duration::ZERO,
            start_delay_max: Duration::from_secs(1),
            auto_broadcast_enabled: true,
            auto_broadcast_threshold: 0,
            auto_broadcast_interval: Duration::from_secs(2),
            max_client_connections: 4,
            dead_node_grace_period: Duration::from_secs(30),
            consumer_workers: 4,
            consumer_queue_capacity: 1024,
            publish_workers: 4,
            publish_queue_capacity: 1024,
            reuse_channels: true,
            broadcast_provider: TransportKind::Udp,
            unicast_provider: TransportKind::Tcp,
            unicast_bind: SocketAddr::from(([0, 0, 0, 0], 7947)),
            unicast_advertise: None,
            broadcast_group: SocketAddr::from(([239, 255, 77, 77], 7946)),
            broadcast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            log_level: "info".to_string(),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from defaults, `VIBEMESH__*` environment
    /// variables and `overrides`, in increasing priority.
    ///
    /// - `VIBEMESH__HEARTBEAT_TIMEOUT=10s` overrides `heartbeat_timeout`
    /// - `VIBEMESH__DOMAIN=orders` overrides `domain`
    pub fn from_map(overrides: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            Environment::with_prefix("VIBEMESH")
                .prefix_separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key.to_ascii_lowercase(), value.as_str())?;
        }

        let config: ChannelConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_map(&HashMap::new())
    }

    /// Same settings in another domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Configured node id, or a freshly generated one
    pub fn resolve_node_id(&self) -> NodeId {
        match &self.node_id {
            Some(id) => NodeId::new(id.clone()),
            None => NodeId::generate(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::Validation("domain must not be empty".to_string()));
        }

        let intervals = [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("control_interval", self.control_interval),
            ("gossip_interval", self.gossip_interval),
            ("auto_broadcast_interval", self.auto_broadcast_interval),
            ("health_check_delegate_timeout", self.health_check_delegate_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }

        let sizes = [
            ("control_batch_size", self.control_batch_size),
            ("max_client_connections", self.max_client_connections),
            ("consumer_workers", self.consumer_workers),
            ("consumer_queue_capacity", self.consumer_queue_capacity),
            ("publish_workers", self.publish_workers),
            ("publish_queue_capacity", self.publish_queue_capacity),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be at least 1", name)));
            }
        }

        if self.publish_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "publish_max_attempts must be at least 1".to_string(),
            ));
        }

        if self.publish_interval_min > self.publish_interval_max {
            return Err(ConfigError::Validation(
                "publish_interval_min must not exceed publish_interval_max".to_string(),
            ));
        }

        if self.start_delay_min > self.start_delay_max {
            return Err(ConfigError::Validation(
                "start_delay_min must not exceed start_delay_max".to_string(),
            ));
        }

        if let Err(e) = EnvFilter::try_new(&self.log_level) {
            return Err(ConfigError::Validation(format!(
                "log_level '{}' is not a valid filter: {}",
                self.log_level, e
            )));
        }

        Ok(())
    }

    /// Install the global subscriber at `log_level`. `RUST_LOG` still wins.
    pub fn init_logging(&self) -> bool {
        crate::logging::init(&self.log_level)
    }
}
