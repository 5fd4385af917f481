//! Application configuration loaded from environment variables.

use serde::Deserialize;
use url::Url;

use crate::channel::{ChannelKey, RegistryConfig};
use crate::error::ConfigError;
use crate::feed::ReconnectConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Feed ===
    /// Streaming endpoint.
    #[serde(default = "default_ws_url")]
    pub feed_ws_url: String,

    /// Channel keys to subscribe to, comma separated.
    #[serde(default = "default_channels")]
    pub feed_channels: Vec<String>,

    // === Aggregation ===
    /// Candle intervals in seconds, comma separated.
    #[serde(default = "default_intervals")]
    pub candle_intervals: Vec<i64>,

    /// Levels retained per side of each book.
    #[serde(default = "default_depth_cap")]
    pub book_depth_cap: usize,

    /// Levels per side published to readers.
    #[serde(default = "default_view_depth")]
    pub book_view_depth: usize,

    // === WebSocket Configuration ===
    /// Upper bound on reconnect backoff.
    #[serde(default = "default_reconnect_max_delay")]
    pub ws_reconnect_max_delay_s: u64,

    /// Ping interval; also the staleness threshold for inbound data.
    #[serde(default = "default_heartbeat_interval")]
    pub ws_heartbeat_interval_s: u64,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_ws_url() -> String {
    "wss://streamer.cryptocompare.com/v2".to_string()
}

fn default_channels() -> Vec<String> {
    vec!["0~Coinbase~BTC~USD".to_string()]
}

fn default_intervals() -> Vec<i64> {
    vec![60, 300, 3_600]
}

fn default_depth_cap() -> usize {
    crate::orderbook::DEFAULT_DEPTH_CAP
}

fn default_view_depth() -> usize {
    crate::channel::DEFAULT_VIEW_DEPTH
}

fn default_reconnect_max_delay() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_ws_url: default_ws_url(),
            feed_channels: default_channels(),
            candle_intervals: default_intervals(),
            book_depth_cap: default_depth_cap(),
            book_view_depth: default_view_depth(),
            ws_reconnect_max_delay_s: default_reconnect_max_delay(),
            ws_heartbeat_interval_s: default_heartbeat_interval(),
            port: default_port(),
            rust_log: default_log_level(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.feed_ws_url)
            .map_err(|_| ConfigError::InvalidUrl(self.feed_ws_url.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(self.feed_ws_url.clone()));
        }

        self.channel_keys()?;

        if self.candle_intervals.is_empty() {
            return Err(ConfigError::NoIntervals);
        }
        if let Some(&bad) = self.candle_intervals.iter().find(|&&i| i <= 0) {
            return Err(ConfigError::InvalidInterval(bad));
        }

        if self.book_view_depth == 0 || self.book_view_depth > self.book_depth_cap {
            return Err(ConfigError::InvalidDepth {
                depth_cap: self.book_depth_cap,
                view_depth: self.book_view_depth,
            });
        }

        Ok(())
    }

    /// Parsed channel keys, blanks skipped.
    pub fn channel_keys(&self) -> Result<Vec<ChannelKey>, ConfigError> {
        let keys = self
            .feed_channels
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                raw.parse::<ChannelKey>()
                    .map_err(|_| ConfigError::InvalidChannel(raw.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if keys.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        Ok(keys)
    }

    /// Registry settings derived from the book depth options.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            depth_cap: self.book_depth_cap,
            view_depth: self.book_view_depth,
        }
    }

    /// Reconnect policy for the feed.
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_delay_s: self.ws_reconnect_max_delay_s,
            heartbeat_interval_s: self.ws_heartbeat_interval_s,
            ..ReconnectConfig::default()
        }
    }
}
