//! Configuration for poly-relay.
//!
//! Loaded from a TOML file, with environment variable overrides for
//! credentials and CLI overrides for operational knobs.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::consumer::StreamTarget;
use crate::normalize::is_valid_slug;

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Logging level filter.
    pub log_level: String,

    /// Seconds between status reports.
    pub status_interval_secs: u64,

    /// Event stream connection.
    pub stream: StreamConfig,

    /// Market binding behavior.
    pub market: MarketConfig,

    /// Order execution parameters.
    pub execution: ExecutionConfig,

    /// Display-only price feed.
    pub feed: FeedConfig,
}

/// Event stream connection parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream host.
    pub host: String,

    /// Stream port.
    pub port: u16,

    /// Channel to subscribe.
    pub channel: String,

    /// Auth token (loaded from env, never committed in the file).
    pub token: Option<String>,

    /// Signals older than this at processing time are dropped.
    pub max_signal_age_ms: u64,
}

/// Market binding parameters.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Market to bind at startup, before any stream message arrives.
    pub default_slug: Option<String>,

    /// Delay between resolution retries (milliseconds).
    pub resolve_retry_delay_ms: u64,

    /// Gamma API base URL override.
    pub gamma_url: Option<String>,
}

/// Order execution parameters.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Shares per BUY order; also the SELL cap.
    pub shares_per_trade: Decimal,

    /// Exchange API key (loaded from env).
    pub api_key: Option<String>,

    /// CLOB API base URL override.
    pub clob_url: Option<String>,
}

/// Display-only price feed parameters.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Stream venue prices for the bound market.
    pub enabled: bool,

    /// Market data WebSocket URL override.
    pub ws_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            status_interval_secs: 60,
            stream: StreamConfig {
                host: "localhost".to_string(),
                port: 9443,
                channel: "signals".to_string(),
                token: None,
                max_signal_age_ms: 30_000,
            },
            market: MarketConfig {
                default_slug: None,
                resolve_retry_delay_ms: 5_000,
                gamma_url: None,
            },
            execution: ExecutionConfig {
                shares_per_trade: dec!(25),
                api_key: None,
                clob_url: None,
            },
            feed: FeedConfig {
                enabled: true,
                ws_url: None,
            },
        }
    }
}

// Raw file shape. Every field optional so a partial file works.

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    log_level: Option<String>,
    status_interval_secs: Option<u64>,
    #[serde(default)]
    stream: TomlStream,
    #[serde(default)]
    market: TomlMarket,
    #[serde(default)]
    execution: TomlExecution,
    #[serde(default)]
    feed: TomlFeed,
}

#[derive(Debug, Default, Deserialize)]
struct TomlStream {
    host: Option<String>,
    port: Option<u16>,
    channel: Option<String>,
    max_signal_age_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlMarket {
    default_slug: Option<String>,
    resolve_retry_delay_ms: Option<u64>,
    gamma_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlExecution {
    shares_per_trade: Option<Decimal>,
    clob_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlFeed {
    enabled: Option<bool>,
    ws_url: Option<String>,
}

impl From<TomlConfig> for RelayConfig {
    fn from(file: TomlConfig) -> Self {
        let mut config = RelayConfig::default();
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        if let Some(secs) = file.status_interval_secs {
            config.status_interval_secs = secs;
        }
        if let Some(host) = file.stream.host {
            config.stream.host = host;
        }
        if let Some(port) = file.stream.port {
            config.stream.port = port;
        }
        if let Some(channel) = file.stream.channel {
            config.stream.channel = channel;
        }
        if let Some(age) = file.stream.max_signal_age_ms {
            config.stream.max_signal_age_ms = age;
        }
        config.market.default_slug = file.market.default_slug;
        if let Some(delay) = file.market.resolve_retry_delay_ms {
            config.market.resolve_retry_delay_ms = delay;
        }
        config.market.gamma_url = file.market.gamma_url;
        if let Some(shares) = file.execution.shares_per_trade {
            config.execution.shares_per_trade = shares;
        }
        config.execution.clob_url = file.execution.clob_url;
        if let Some(enabled) = file.feed.enabled {
            config.feed.enabled = enabled;
        }
        config.feed.ws_url = file.feed.ws_url;
        config
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for credentials.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("RELAY_STREAM_TOKEN") {
            self.stream.token = Some(token);
        }
        if let Ok(key) = std::env::var("RELAY_API_KEY") {
            self.execution.api_key = Some(key);
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        channel: Option<String>,
        market: Option<String>,
    ) {
        if let Some(host) = host {
            self.stream.host = host;
        }
        if let Some(port) = port {
            self.stream.port = port;
        }
        if let Some(channel) = channel {
            self.stream.channel = channel;
        }
        if let Some(market) = market {
            self.market.default_slug = Some(market);
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.stream.host.is_empty() {
            bail!("stream.host must not be empty");
        }
        if self.stream.channel.is_empty() {
            bail!("stream.channel must not be empty");
        }
        if self.stream.token.is_none() {
            bail!("stream auth token required, set RELAY_STREAM_TOKEN");
        }
        if self.execution.api_key.is_none() {
            bail!("exchange API key required, set RELAY_API_KEY");
        }
        if self.execution.shares_per_trade <= Decimal::ZERO {
            bail!("execution.shares_per_trade must be positive");
        }
        if let Some(slug) = &self.market.default_slug {
            if !is_valid_slug(&slug.trim().to_ascii_lowercase()) {
                bail!("market.default_slug {:?} is not a valid market slug", slug);
            }
        }
        if self.status_interval_secs == 0 {
            bail!("status_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// The stream connection target described by this configuration.
    ///
    /// `validate` must have passed, so the token is present.
    pub fn stream_target(&self) -> StreamTarget {
        StreamTarget {
            host: self.stream.host.clone(),
            port: self.stream.port,
            channel: self.stream.channel.clone(),
            token: self.stream.token.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.stream.token = Some("tok".to_string());
        config.execution.api_key = Some("key".to_string());
        config
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.stream.max_signal_age_ms, 30_000);
        assert_eq!(config.market.resolve_retry_delay_ms, 5_000);
        assert_eq!(config.execution.shares_per_trade, dec!(25));
        assert_eq!(config.status_interval_secs, 60);
        assert!(config.feed.enabled);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RelayConfig::from_toml_str(
            r#"
            log_level = "debug"

            [stream]
            host = "feed.example.com"
            port = 9000

            [execution]
            shares_per_trade = "50"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.stream.host, "feed.example.com");
        assert_eq!(config.stream.port, 9000);
        // Untouched sections keep defaults.
        assert_eq!(config.stream.channel, "signals");
        assert_eq!(config.execution.shares_per_trade, dec!(50));
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(RelayConfig::from_toml_str("stream = 12").is_err());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = RelayConfig::default();
        assert!(config.validate().is_err());
        config.stream.token = Some("tok".to_string());
        assert!(config.validate().is_err());
        config.execution.api_key = Some("key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid_config();
        config.execution.shares_per_trade = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.market.default_slug = Some("BAD SLUG".to_string());
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.market.default_slug = Some("btc-updown-15m-1700000000".to_string());
        assert!(config.validate().is_ok());

        let mut config = valid_config();
        config.status_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = valid_config();
        config.apply_cli_overrides(
            Some("cli-host".to_string()),
            Some(1234),
            None,
            Some("btc-updown-15m-1700000000".to_string()),
        );
        assert_eq!(config.stream.host, "cli-host");
        assert_eq!(config.stream.port, 1234);
        assert_eq!(config.stream.channel, "signals");
        assert_eq!(
            config.market.default_slug.as_deref(),
            Some("btc-updown-15m-1700000000")
        );
    }

    #[test]
    fn test_stream_target() {
        let config = valid_config();
        let target = config.stream_target();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 9443);
        assert_eq!(target.channel, "signals");
        assert_eq!(target.token, "tok");
    }
}
