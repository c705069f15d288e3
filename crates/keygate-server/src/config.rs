use std::time::Duration;

use keygate_auth::TokenConfig;
use keygate_auth_redis::redact_url;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub populator: PopulatorConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Store validation
        if self.store.backend == StoreBackend::Memory && self.store.sweep_interval.is_zero() {
            return Err("store.sweep_interval must be > 0".into());
        }
        if self.store.backend == StoreBackend::Redis {
            if self.store.url.is_empty() {
                return Err("store.url is required for the redis backend".into());
            }
            if self.store.pool_size == 0 {
                return Err("store.pool_size must be > 0".into());
            }
            if self.store.timeout.is_zero() {
                return Err("store.timeout must be > 0".into());
            }
        }
        self.tokens.validate().map_err(|e| format!("tokens: {e}"))?;
        Ok(())
    }

    /// Renders the effective configuration, with any Redis password masked.
    pub fn to_toml(&self) -> Result<String, String> {
        let mut shown = self.clone();
        shown.store.url = redact_url(&shown.store.url);
        toml::to_string_pretty(&shown).map_err(|e| format!("config render error: {e}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Backing store for sessions and signing-key blocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart and not shared.
    #[default]
    Memory,
    /// Shared Redis store.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How often the memory backend purges expired entries
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}
fn default_pool_size() -> usize {
    10
}
fn default_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            pool_size: default_pool_size(),
            timeout: default_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulatorConfig {
    /// Run the signing-key populator in this process
    #[serde(default = "default_populator_enabled")]
    pub enabled: bool,
}
fn default_populator_enabled() -> bool {
    true
}
impl Default for PopulatorConfig {
    fn default() -> Self {
        Self {
            enabled: default_populator_enabled(),
        }
    }
}

pub mod loader {
    use super::ServerConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, relative to the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "keygate.toml";

    pub fn load_config(path: Option<&str>) -> Result<ServerConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", pathbuf.display()));
        }
        // Environment variable overrides, e.g., KEYGATE__TOKENS__ISSUER=https://gw
        builder = builder.add_source(
            Environment::with_prefix("KEYGATE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: ServerConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}
