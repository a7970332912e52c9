//! Client Configuration Settings
//!
//! Configuration types for the feed client, loaded from environment variables.

use std::time::Duration;

use crate::domain::market_data::TimestampSource;

/// Feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Maximum consecutive reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay unit for linear backoff; attempt `n` waits `n` of these.
    pub reconnect_base_delay: Duration,
    /// Backoff jitter as a fraction of the delay (0 = none).
    pub reconnect_jitter: f64,
    /// Heartbeat ping interval (0 = disabled).
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
}

impl FeedSettings {
    /// Settings for `url` with every other value at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_jitter: 0.0,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Ticker settings used by the binary.
#[derive(Debug, Clone)]
pub struct TickerSettings {
    /// Symbols to follow.
    pub symbols: Vec<String>,
    /// Polling interval (0 = push only).
    pub update_interval: Duration,
    /// Also follow trading status.
    pub include_trading_status: bool,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["EUR/USD".to_string()],
            update_interval: Duration::ZERO,
            include_trading_status: false,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Feed connection settings.
    pub feed: FeedSettings,
    /// Timestamp source for ticks.
    pub timestamp_source: TimestampSource,
    /// Ticker settings.
    pub ticker: TickerSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FEED_URL` is missing, empty or not a
    /// WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("MARKET_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_FEED_URL".to_string()))?;

        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FEED_URL".to_string()));
        }

        let url = validate_ws_url(url.trim())?;
        let defaults = FeedSettings::new(url.clone());

        let feed = FeedSettings {
            url,
            max_reconnect_attempts: parse_env_u32(
                &lookup,
                "MARKET_FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_base_delay: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay,
            ),
            reconnect_jitter: parse_env_f64(
                &lookup,
                "MARKET_FEED_RECONNECT_JITTER",
                defaults.reconnect_jitter,
            )
            .clamp(0.0, 1.0),
            heartbeat_interval: parse_env_duration_secs(
                &lookup,
                "MARKET_FEED_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                &lookup,
                "MARKET_FEED_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
        };

        let timestamp_source = lookup("MARKET_FEED_TIMESTAMP_SOURCE")
            .map(|s| TimestampSource::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let ticker_defaults = TickerSettings::default();
        let symbols = lookup("MARKET_FEED_SYMBOLS")
            .map(|s| parse_symbols(&s))
            .filter(|symbols| !symbols.is_empty())
            .unwrap_or(ticker_defaults.symbols);

        let ticker = TickerSettings {
            symbols,
            update_interval: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_UPDATE_INTERVAL_MS",
                ticker_defaults.update_interval,
            ),
            include_trading_status: parse_env_bool(
                &lookup,
                "MARKET_FEED_INCLUDE_STATUS",
                ticker_defaults.include_trading_status,
            ),
        };

        let server = ServerSettings {
            metrics_port: parse_env_u16(
                &lookup,
                "MARKET_FEED_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        Ok(Self {
            feed,
            timestamp_source,
            ticker,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Feed URL is not a usable WebSocket URL.
    #[error("invalid feed URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

fn validate_ws_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(raw.to_string())
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env_u16<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u16) -> u16 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_env_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_env_f64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_env_bool<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn parse_env_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
