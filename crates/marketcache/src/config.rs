use std::time::Duration;

use marketcache_core::{CacheError, CacheKey, EventSource, KeyClass, KeyPolicy};
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CacheError {
    fn from(e: ConfigError) -> Self {
        CacheError::Configuration(e.to_string())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub local: LocalTierConfig,
    /// Shared volatile tier
    #[serde(default = "BackendConfig::fast_defaults")]
    pub fast: BackendConfig,
    /// Shared persistent tier, also carries the pub/sub channel
    #[serde(default = "BackendConfig::durable_defaults")]
    pub durable: BackendConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub keys: KeyPolicyConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            fast: BackendConfig::fast_defaults(),
            durable: BackendConfig::durable_defaults(),
            breaker: BreakerConfig::default(),
            keys: KeyPolicyConfig::default(),
            bridge: BridgeConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Local tier
        if self.local.max_entries == 0 {
            return Err(invalid("local.max_entries must be > 0"));
        }
        if self.local.local_ttl_secs == 0 || self.local.cross_process_ttl_secs == 0 {
            return Err(invalid("local tier TTLs must be > 0"));
        }

        // Shared tiers
        for (name, backend) in [("fast", &self.fast), ("durable", &self.durable)] {
            if !backend.enabled {
                continue;
            }
            if backend.host.trim().is_empty() {
                return Err(invalid(format!("{name}.host must not be empty")));
            }
            if backend.port == 0 {
                return Err(invalid(format!("{name}.port must be > 0")));
            }
            if backend.pool_size == 0 {
                return Err(invalid(format!("{name}.pool_size must be > 0")));
            }
            if backend.timeout_ms == 0 {
                return Err(invalid(format!("{name}.timeout_ms must be > 0")));
            }
        }

        // Breaker
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be > 0"));
        }
        if self.breaker.cooldown_secs == 0 {
            return Err(invalid("breaker.cooldown_secs must be > 0"));
        }

        // Key classification
        self.keys.policy().map_err(|e| invalid(e.to_string()))?;

        // Bridge
        if self.bridge.channel.trim().is_empty() {
            return Err(invalid("bridge.channel must not be empty"));
        }
        if self.bridge.warm_interval_secs == 0
            || self.bridge.heartbeat_interval_secs == 0
            || self.bridge.peer_timeout_secs == 0
            || self.bridge.warm_ttl_secs == 0
        {
            return Err(invalid("bridge intervals and TTLs must be > 0"));
        }
        for key in &self.bridge.critical_keys {
            CacheKey::parse(key)
                .map_err(|e| invalid(format!("bridge.critical_keys: {e}")))?;
        }

        if self.health.probe_ttl_secs == 0 {
            return Err(invalid("health.probe_ttl_secs must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Maximum entries held in process before LRU eviction
    #[serde(default = "default_local_max_entries")]
    pub max_entries: usize,
    /// Local TTL for local-affinity keys
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,
    /// Local TTL for cross-process keys
    #[serde(default = "default_cross_process_ttl_secs")]
    pub cross_process_ttl_secs: u64,
}

fn default_local_max_entries() -> usize {
    1000
}

fn default_local_ttl_secs() -> u64 {
    30
}

fn default_cross_process_ttl_secs() -> u64 {
    2
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_entries: default_local_max_entries(),
            local_ttl_secs: default_local_ttl_secs(),
            cross_process_ttl_secs: default_cross_process_ttl_secs(),
        }
    }
}

impl LocalTierConfig {
    pub fn ttl_for(&self, class: KeyClass) -> Duration {
        match class {
            KeyClass::LocalAffinity => Duration::from_secs(self.local_ttl_secs),
            KeyClass::CrossProcess => Duration::from_secs(self.cross_process_ttl_secs),
        }
    }
}

/// Connection settings for one shared tier (Redis protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Disabled tiers are skipped entirely
    #[serde(default = "default_backend_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Logical database index
    #[serde(default)]
    pub db: u8,
    #[serde(default)]
    pub password: Option<String>,
    /// Connection pool size
    #[serde(default = "default_backend_pool_size")]
    pub pool_size: usize,
    /// Per-call timeout in milliseconds, also used for pool waits
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_enabled() -> bool {
    true
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    6379
}

fn default_backend_pool_size() -> usize {
    10
}

fn default_backend_timeout_ms() -> u64 {
    2000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: default_backend_enabled(),
            host: default_backend_host(),
            port: default_backend_port(),
            db: 0,
            password: None,
            pool_size: default_backend_pool_size(),
            timeout_ms: default_backend_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn fast_defaults() -> Self {
        Self {
            port: 6380,
            pool_size: 20,
            timeout_ms: 500,
            ..Self::default()
        }
    }

    pub fn durable_defaults() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before probing
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicyConfig {
    #[serde(default = "default_cross_process_categories")]
    pub cross_process_categories: Vec<String>,
    #[serde(default)]
    pub local_categories: Vec<String>,
    /// Class applied to categories listed in neither list
    #[serde(default = "default_unclassified")]
    pub unclassified: KeyClass,
}

fn default_cross_process_categories() -> Vec<String> {
    ["market", "analysis", "system", "orderbook"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_unclassified() -> KeyClass {
    KeyClass::CrossProcess
}

impl Default for KeyPolicyConfig {
    fn default() -> Self {
        Self {
            cross_process_categories: default_cross_process_categories(),
            local_categories: Vec::new(),
            unclassified: default_unclassified(),
        }
    }
}

impl KeyPolicyConfig {
    pub fn policy(&self) -> Result<KeyPolicy, CacheError> {
        KeyPolicy::new(
            self.cross_process_categories.iter().cloned(),
            self.local_categories.iter().cloned(),
            self.unclassified,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Pub/sub channel shared by every process of a deployment
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Logical role of this process
    #[serde(default = "default_role")]
    pub role: EventSource,
    #[serde(default = "default_warm_interval_secs")]
    pub warm_interval_secs: u64,
    /// TTL used when the warming loop publishes a safe default
    #[serde(default = "default_warm_ttl_secs")]
    pub warm_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A peer counts as connected if its heartbeat is younger than this
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_critical_keys")]
    pub critical_keys: Vec<String>,
}

fn default_channel() -> String {
    "marketcache:events".to_string()
}

fn default_role() -> EventSource {
    EventSource::Consumer
}

fn default_warm_interval_secs() -> u64 {
    60
}

fn default_warm_ttl_secs() -> u64 {
    90
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_peer_timeout_secs() -> u64 {
    60
}

fn default_critical_keys() -> Vec<String> {
    vec!["market:overview".to_string(), "analysis:signals".to_string()]
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            role: default_role(),
            warm_interval_secs: default_warm_interval_secs(),
            warm_ttl_secs: default_warm_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            critical_keys: default_critical_keys(),
        }
    }
}

impl BridgeConfig {
    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs)
    }

    pub fn warm_ttl(&self) -> Duration {
        Duration::from_secs(self.warm_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// TTL of the synthetic probe value written by health checks
    #[serde(default = "default_probe_ttl_secs")]
    pub probe_ttl_secs: u64,
    /// Round trips slower than this report the tier as degraded
    #[serde(default = "default_slow_probe_ms")]
    pub slow_probe_ms: u64,
}

fn default_probe_ttl_secs() -> u64 {
    10
}

fn default_slow_probe_ms() -> u64 {
    250
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_ttl_secs: default_probe_ttl_secs(),
            slow_probe_ms: default_slow_probe_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder at startup
    #[serde(default)]
    pub prometheus: bool,
}

pub mod loader {
    use super::{ConfigError, Settings};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default settings file looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "marketcache.toml";

    pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "config file not found, using defaults");
        }
        // Environment variable overrides, e.g. MARKETCACHE__FAST__PORT=11311
        builder = builder.add_source(
            Environment::with_prefix("MARKETCACHE")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("bridge.critical_keys")
                .with_list_parse_key("keys.cross_process_categories")
                .with_list_parse_key("keys.local_categories"),
        );
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a TOML string, bypassing files and environment.
    pub fn from_toml_str(source: &str) -> Result<Settings, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.local.max_entries, 1000);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert_eq!(settings.bridge.heartbeat_interval_secs, 15);
        assert_eq!(settings.fast.port, 6380);
    }

    #[test]
    fn test_serde_defaults_split_tiers() {
        let settings = loader::from_toml_str("").unwrap();
        assert_eq!(settings.fast.port, 6380);
        assert_eq!(settings.fast.timeout_ms, 500);
        assert_eq!(settings.durable.port, 6379);
        assert_eq!(settings.durable.timeout_ms, 2000);
        assert_eq!(settings.bridge.role, EventSource::Consumer);
    }

    #[test]
    fn test_toml_overrides() {
        let settings = loader::from_toml_str(
            r#"
            [local]
            max_entries = 64
            cross_process_ttl_secs = 1

            [fast]
            host = "cache.internal"
            port = 11311

            [bridge]
            role = "producer"
            critical_keys = ["market:overview"]

            [keys]
            local_categories = ["scratch"]
            unclassified = "local_affinity"
            "#,
        )
        .unwrap();

        assert_eq!(settings.local.max_entries, 64);
        assert_eq!(settings.fast.url(), "redis://cache.internal:11311/0");
        assert_eq!(settings.bridge.role, EventSource::Producer);
        assert_eq!(settings.keys.unclassified, KeyClass::LocalAffinity);
        assert_eq!(
            settings.local.ttl_for(KeyClass::CrossProcess),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_load_settings_from_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[breaker]\nfailure_threshold = 3\n\n[durable]\nenabled = false").unwrap();

        let settings = loader::load_settings(file.path().to_str()).unwrap();
        assert_eq!(settings.breaker.failure_threshold, 3);
        assert!(!settings.durable.enabled);
        assert_eq!(settings.local.max_entries, 1000);
    }

    #[test]
    fn test_zero_local_size_is_fatal() {
        let err = loader::from_toml_str("[local]\nmax_entries = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let cache_err: CacheError = err.into();
        assert!(matches!(cache_err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.keys.local_categories = vec!["market".into()];
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.bridge.critical_keys = vec!["overview".into()];
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.breaker.cooldown_secs = 0;
        assert!(settings.validate().is_err());

        // Disabled tiers are not validated.
        let mut settings = Settings::default();
        settings.fast = BackendConfig::disabled();
        settings.fast.port = 0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_password_in_url() {
        let backend = BackendConfig {
            password: Some("s3cret".into()),
            db: 2,
            ..BackendConfig::default()
        };
        assert_eq!(backend.url(), "redis://:s3cret@127.0.0.1:6379/2");
    }
}
