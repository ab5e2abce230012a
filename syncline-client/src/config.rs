//! Configuration loading for the syncline client.
//!
//! Loaded from TOML at `--config <path>` or `SYNCLINE_CONFIG`. Connection and
//! auth fields are required; tuning sections fall back to defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use syncline_storage::{CacheConfig, DEFAULT_NAMESPACE, NAMESPACE_TERMINATOR};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "SYNCLINE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    pub request_timeout_ms: u64,
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    pub path: PathBuf,
    pub max_size_mb: usize,
    pub namespace: String,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".syncline/cache"),
            max_size_mb: 64,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuerySection {
    pub stale_time_secs: u64,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            stale_time_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RealtimeSection {
    /// Number of recently applied events remembered per owner scope.
    pub dedup_window: usize,
    /// Capacity of the transient alert queue.
    pub alert_buffer: usize,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            dedup_window: 512,
            alert_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl ReconnectConfig {
    /// Delay before the zero-based reconnect `attempt`.
    ///
    /// Grows from `initial_ms` by `multiplier` per attempt up to `max_ms`,
    /// then adds up to `jitter_ms` taken from `entropy`.
    pub fn delay(&self, attempt: u32, entropy: u64) -> Duration {
        let growth = self.multiplier.powi(attempt.min(64) as i32);
        let base = (self.initial_ms as f64 * growth).min(self.max_ms as f64) as u64;
        let jitter = match self.jitter_ms {
            0 => 0,
            spread => entropy % (spread + 1),
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or SYNCLINE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Failed to install tracing subscriber: {0}")]
    Telemetry(String),
}

impl SyncConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(invalid("api_base_url", "must not be empty"));
        }
        if self.ws_endpoint.trim().is_empty() {
            return Err(invalid("ws_endpoint", "must not be empty"));
        }
        if self.auth.api_key.is_none() && self.auth.jwt.is_none() {
            return Err(invalid("auth", "api_key or jwt must be provided"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }
        if self.cache.path.as_os_str().is_empty() {
            return Err(invalid("cache.path", "must not be empty"));
        }
        if self.cache.max_size_mb == 0 {
            return Err(invalid("cache.max_size_mb", "must be > 0"));
        }
        if self.cache.namespace.is_empty() {
            return Err(invalid("cache.namespace", "must not be empty"));
        }
        if self.cache.namespace.contains(NAMESPACE_TERMINATOR) {
            return Err(invalid("cache.namespace", "must not contain NUL"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be > 0"));
        }
        if self.query.stale_time_secs == 0 {
            return Err(invalid("query.stale_time_secs", "must be > 0"));
        }
        if self.realtime.dedup_window == 0 {
            return Err(invalid("realtime.dedup_window", "must be > 0"));
        }
        if self.realtime.alert_buffer == 0 {
            return Err(invalid("realtime.alert_buffer", "must be > 0"));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid("reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_secs(self.query.stale_time_secs)
    }

    /// Cache store settings derived from the `[cache]` section.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_namespace(self.cache.namespace.clone())
            .with_ttl(Duration::from_secs(self.cache.ttl_secs))
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        api_base_url = "https://example.supabase.co/rest/v1"
        ws_endpoint = "wss://example.supabase.co/realtime/v1/websocket"
        request_timeout_ms = 10000

        [auth]
        api_key = "anon-key"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SyncConfig::from_toml_str(MINIMAL).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.cache.namespace, "@appejv_cache:");
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.stale_time(), Duration::from_secs(300));
        assert_eq!(config.realtime.dedup_window, 512);
        assert_eq!(config.cache_config().ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_missing_auth_rejected() {
        let toml = MINIMAL.replace("api_key = \"anon-key\"", "");
        let config = SyncConfig::from_toml_str(&toml).expect("parse");
        let err = config.validate().expect_err("auth required");
        assert!(matches!(err, ConfigError::InvalidValue { field: "auth", .. }));
    }

    #[test]
    fn test_bad_reconnect_rejected() {
        let toml = format!("{MINIMAL}\n[reconnect]\ninitial_ms = 1000\nmax_ms = 10\n");
        let config = SyncConfig::from_toml_str(&toml).expect("parse");
        let err = config.validate().expect_err("max < initial");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_namespace_with_terminator_rejected() {
        let mut config = SyncConfig::from_toml_str(MINIMAL).expect("parse");
        config.cache.namespace = "app\0".to_string();
        let err = config.validate().expect_err("NUL in namespace");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "cache.namespace",
                ..
            }
        ));
    }

    #[test]
    fn test_reconnect_delay_grows_to_cap() {
        let reconnect = ReconnectConfig {
            initial_ms: 500,
            max_ms: 4_000,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        let delays: Vec<u64> = (0..6)
            .map(|attempt| reconnect.delay(attempt, 0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
        assert_eq!(reconnect.delay(u32::MAX, 0), Duration::from_millis(4_000));
    }

    #[test]
    fn test_reconnect_jitter_stays_within_spread() {
        let reconnect = ReconnectConfig::default();
        for entropy in [0, 1, 249, 250, 251, 999_999_999] {
            let delay = reconnect.delay(0, entropy).as_millis() as u64;
            assert!((500..=750).contains(&delay), "delay {delay}");
        }
        assert_eq!(reconnect.delay(0, 250), Duration::from_millis(750));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml = format!("{MINIMAL}\nrefresh_interval_ms = 5\n");
        assert!(matches!(
            SyncConfig::from_toml_str(&toml),
            Err(ConfigError::Parse(_))
        ));
    }
}
