use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "parley.toml",
    "config/parley.toml",
    "crates/config/parley.toml",
    "../parley.toml",
    "../config/parley.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub sequencer: SequencerConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub presence: PresenceConfig,
    pub bus: BusConfig,
    pub fanout: FanoutConfig,
    pub membership: MembershipConfig,
}

impl AppConfig {
    /// Reject combinations that would break delivery guarantees at runtime.
    ///
    /// ```
    /// use parley_config::AppConfig;
    ///
    /// let mut config = AppConfig::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.gateway.heartbeat_interval_seconds = 45;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.presence.ttl_seconds == 0 {
            bail!("presence.ttl_seconds must be greater than zero");
        }
        if self.gateway.heartbeat_interval_seconds == 0 {
            bail!("gateway.heartbeat_interval_seconds must be greater than zero");
        }
        // One missed heartbeat must not expire a live record.
        if self.gateway.heartbeat_interval_seconds * 2 > self.presence.ttl_seconds {
            bail!(
                "gateway.heartbeat_interval_seconds ({}) must be at most half of presence.ttl_seconds ({})",
                self.gateway.heartbeat_interval_seconds,
                self.presence.ttl_seconds
            );
        }
        if self.gateway.gateway_id.trim().is_empty() {
            bail!("gateway.gateway_id must not be empty");
        }
        if self.bus.partitions == 0 {
            bail!("bus.partitions must be greater than zero");
        }
        if self.fanout.instance_count == 0 || self.fanout.instance_index >= self.fanout.instance_count {
            bail!(
                "fanout.instance_index ({}) must be lower than fanout.instance_count ({})",
                self.fanout.instance_index,
                self.fanout.instance_count
            );
        }
        if self.membership.max_attempts == 0 {
            bail!("membership.max_attempts must be greater than zero");
        }
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub address: String,
    pub port: u16,
    pub gateway_id: String,
    pub heartbeat_interval_seconds: u64,
    /// Frames queued per socket before new ones are dropped.
    pub outbound_buffer: usize,
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 3004,
            gateway_id: "gateway-unknown".to_string(),
            heartbeat_interval_seconds: 30,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 3002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://parley.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Lifetime of tokens minted by the `issue-token` helper.
    pub token_ttl_seconds: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "development-secret".to_string(),
            issuer: None,
            audience: None,
            token_ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ttl_seconds: u64,
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_seconds: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub partitions: u32,
    /// Approximate cap applied to every partition stream on publish.
    pub stream_max_len: usize,
    pub block_ms: u64,
    pub batch_size: usize,
    /// Entries left unacknowledged this long by another consumer are claimed.
    pub redelivery_timeout_seconds: u64,
}

impl BusConfig {
    pub fn redelivery_timeout(&self) -> Duration {
        Duration::from_secs(self.redelivery_timeout_seconds)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            stream_max_len: 100_000,
            block_ms: 5_000,
            batch_size: 32,
            redelivery_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    pub instance_index: u32,
    pub instance_count: u32,
    pub max_delivery_attempts: u32,
}

impl FanoutConfig {
    /// Partitions owned by this router instance.
    ///
    /// ```
    /// use parley_config::FanoutConfig;
    ///
    /// let config = FanoutConfig { instance_index: 1, instance_count: 3, ..FanoutConfig::default() };
    /// assert_eq!(config.owned_partitions(8), vec![1, 4, 7]);
    /// ```
    pub fn owned_partitions(&self, partitions: u32) -> Vec<u32> {
        (0..partitions)
            .filter(|partition| partition % self.instance_count.max(1) == self.instance_index)
            .collect()
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            consumer_group: "fanout-workers".to_string(),
            consumer_name: "fanout-0".to_string(),
            instance_index: 0,
            instance_count: 1,
            max_delivery_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl MembershipConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3002".to_string(),
            timeout_ms: 2_000,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use parley_config::load;
///
/// std::env::remove_var("PARLEY_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.gateway.gateway_id.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder();

    let environment_overrides = config::Environment::with_prefix("PARLEY").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("PARLEY_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via PARLEY_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    config.validate().context("invalid configuration")?;

    debug!(?config, "loaded parley configuration");
    Ok(config)
}
