//! Runtime configuration for the routing core.
//!
//! Layered: built-in defaults -> optional file (`ROUTER_CONFIG_FILE`) ->
//! environment variables prefixed `ROUTER__` (double underscore separates
//! nesting, e.g. `ROUTER__IDS__MAX_MSGS_PER_WINDOW=40`).

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdsConfig {
    pub window_seconds: u64,
    pub max_msgs_per_window: u32,
    pub duplicate_suppression_ttl: u64,
    pub block_peer_after: u32,
    pub block_peer_ttl_seconds: u64,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            window_seconds: 5,
            max_msgs_per_window: 20,
            duplicate_suppression_ttl: 600,
            // Effectively disabled unless explicitly configured.
            block_peer_after: u32::MAX,
            block_peer_ttl_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthRateLimitConfig {
    pub window_seconds: u64,
    pub max_attempts_per_window: u32,
}

impl Default for AuthRateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_attempts_per_window: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ttl_min: i64,
    pub ttl_default: i64,
    pub max_ttl: i64,
    pub max_retries: i64,
    pub base_retry_backoff_ms: u64,
    pub ids: IdsConfig,
    pub auth_rate_limit: AuthRateLimitConfig,
    pub max_queue_size: i64,
    pub max_ciphertext_bytes: usize,
    pub max_ts_skew_seconds: i64,
    pub max_msg_age_seconds: i64,
    pub forwarding_enabled: bool,
    pub debug_mode: bool,
    pub forwarder_interval_ms: u64,
    pub ble_base_url: String,
    pub send_timeout_ms: u64,
    pub db_path: String,
    pub ids_log_path: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_min: 1,
            ttl_default: 4,
            max_ttl: 8,
            max_retries: 5,
            base_retry_backoff_ms: 500,
            ids: IdsConfig::default(),
            auth_rate_limit: AuthRateLimitConfig::default(),
            max_queue_size: 10_000,
            max_ciphertext_bytes: 16_384,
            max_ts_skew_seconds: 300,
            max_msg_age_seconds: 3600,
            forwarding_enabled: false,
            debug_mode: false,
            forwarder_interval_ms: 2_000,
            ble_base_url: "http://localhost:7003".to_string(),
            send_timeout_ms: 5_000,
            db_path: "routing.db".to_string(),
            ids_log_path: "routing_suspicious.log".to_string(),
            port: 9002,
        }
    }
}

impl Config {
    /// Load defaults, then an optional file, then `ROUTER__`-prefixed env vars.
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Ok(path) = std::env::var("ROUTER_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ROUTER")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn forwarder_interval(&self) -> Duration {
        Duration::from_millis(self.forwarder_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
