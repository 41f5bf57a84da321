//! Configuration loading and management
//!
//! `RealtimeConfig` can be built three ways:
//!
//! - `RealtimeConfig::default()`: the production defaults
//! - `RealtimeConfig::from_yaml_file(path)` / `from_yaml_str(yaml)`: durations
//!   are humantime strings (`"100ms"`, `"30s"`, `"24h"`)
//! - `RealtimeConfig::from_env()`: defaults overridden by the process
//!   environment
//!
//! ```yaml
//! rate_limit:
//!   auth_requests_per_window: 10
//!   window: 60s
//! bus:
//!   buffer_size: 100
//!   publish_timeout: 5s
//! session:
//!   shutdown_grace: 30s
//! ```

use anyhow::Result;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Complete configuration of the real-time core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeConfig {
    pub rate_limit: RateLimitConfig,
    pub bus: BusConfig,
    pub session: SessionConfig,
    pub location: LocationConfig,
    pub offline: OfflineConfig,
    /// Connection string of the key-value / pub-sub service
    pub redis_url: Option<String>,
    /// Address the demo server binds to
    pub listen_addr: String,
}

/// Distributed rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Allowed `auth:{ip}` takes per window
    pub auth_requests_per_window: u64,
    /// Allowed `ws:{userID}` session opens per window
    pub ws_connections_per_window: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_requests_per_window: 10,
            ws_connections_per_window: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// Event bus and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of every per-subscriber queue
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub subscribe_timeout: Duration,
    /// Reconnect policy of the transport receive loop
    pub reconnect: BackoffConfig,
    /// Value stamped into `source` of events published by this process
    pub source: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            publish_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            reconnect: BackoffConfig::default(),
            source: "trip-realtime".to_string(),
        }
    }
}

/// Duplex session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the outbound queue
    pub send_buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// A session whose last pong is older than this is drained
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,
    /// Minimum spacing of typing frames sent to one session
    #[serde(with = "humantime_serde")]
    pub typing_interval: Duration,
    /// Write retries a session may spend per `retry_refill`
    pub retry_tokens: u32,
    #[serde(with = "humantime_serde")]
    pub retry_refill: Duration,
    pub retry_backoff: BackoffConfig,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            typing_interval: Duration::from_secs(1),
            retry_tokens: 3,
            retry_refill: Duration::from_secs(10),
            retry_backoff: BackoffConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Location validation windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Oldest accepted client timestamp for live updates
    #[serde(with = "humantime_serde")]
    pub max_past: Duration,
    /// Tolerated client clock skew into the future
    #[serde(with = "humantime_serde")]
    pub max_future: Duration,
    /// Latest locations older than this are not returned
    #[serde(with = "humantime_serde")]
    pub visibility_window: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_past: Duration::from_secs(2 * 3600),
            max_future: Duration::from_secs(5 * 60),
            visibility_window: Duration::from_secs(24 * 3600),
        }
    }
}

/// Offline queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    #[serde(with = "humantime_serde")]
    pub batch_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// Batches and updates older than this are discarded during replay
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    pub max_batch_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            batch_ttl: Duration::from_secs(24 * 3600),
            lock_ttl: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(24 * 3600),
            max_batch_size: 1000,
        }
    }
}

/// Controls an exponential backoff and can be loaded from a config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Jitter, `0.2` means ±20%
    pub randomization_factor: f64,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.2,
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    /// Build a fresh backoff; it never gives up on elapsed time, callers
    /// count attempts against `max_retries` instead
    pub fn build(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff::backoff::Backoff::reset(&mut backoff);
        backoff
    }
}

impl RealtimeConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply environment overrides read through `lookup`
    ///
    /// Unparseable values keep the current setting and log a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_var(&lookup, "RATE_LIMIT_AUTH_REQUESTS_PER_MINUTE") {
            self.rate_limit.auth_requests_per_window = n;
        }
        if let Some(n) = parse_var(&lookup, "RATE_LIMIT_WS_CONNECTIONS_PER_MINUTE") {
            self.rate_limit.ws_connections_per_window = n;
        }
        if let Some(secs) = parse_var(&lookup, "RATE_LIMIT_WINDOW_SECONDS") {
            self.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "EVENT_PUBLISH_TIMEOUT_SECONDS") {
            self.bus.publish_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "EVENT_SUBSCRIBE_TIMEOUT_SECONDS") {
            self.bus.subscribe_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&lookup, "EVENT_BUFFER_SIZE") {
            self.bus.buffer_size = n;
        }
        if let Some(n) = parse_var(&lookup, "WS_SEND_BUFFER_SIZE") {
            self.session.send_buffer_size = n;
        }
        if let Some(secs) = parse_var(&lookup, "SHUTDOWN_GRACE_SECONDS") {
            self.session.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            self.redis_url = Some(url);
        }
        if let Some(addr) = lookup("LISTEN_ADDR").filter(|v| !v.is_empty()) {
            self.listen_addr = addr;
        }
    }

    /// Address to bind, falling back to `0.0.0.0:8080`
    pub fn listen_addr(&self) -> &str {
        if self.listen_addr.is_empty() {
            "0.0.0.0:8080"
        } else {
            &self.listen_addr
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::default();
        assert_eq!(config.rate_limit.auth_requests_per_window, 10);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.bus.buffer_size, 100);
        assert_eq!(config.session.send_buffer_size, 256);
        assert_eq!(config.offline.lock_ttl, Duration::from_secs(300));
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EVENT_BUFFER_SIZE", "8"),
            ("RATE_LIMIT_WINDOW_SECONDS", "10"),
            ("SHUTDOWN_GRACE_SECONDS", "not-a-number"),
            ("REDIS_URL", "redis://cache:6379"),
        ]
        .into_iter()
        .collect();

        let mut config = RealtimeConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bus.buffer_size, 8);
        assert_eq!(config.rate_limit.window, Duration::from_secs(10));
        assert_eq!(config.session.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_yaml_partial_sections() {
        let config = RealtimeConfig::from_yaml_str(
            r#"
bus:
  buffer_size: 4
  publish_timeout: 250ms
session:
  ping_interval: 5s
"#,
        )
        .unwrap();

        assert_eq!(config.bus.buffer_size, 4);
        assert_eq!(config.bus.publish_timeout, Duration::from_millis(250));
        assert_eq!(config.bus.subscribe_timeout, Duration::from_secs(10));
        assert_eq!(config.session.ping_interval, Duration::from_secs(5));
        assert_eq!(config.session.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = BackoffConfig {
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(300),
            ..Default::default()
        }
        .build();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
    }
}
