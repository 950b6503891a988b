//! Configuration management for the cross-venue maker.
//!
//! Loads settings from an optional config file, then environment variables
//! prefixed with `CVM` (`CVM__ENGINE__KEEP_ALIVE_SECS=120`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Watchdog and scheduling parameters
    #[serde(default)]
    pub engine: EngineConfig,
    /// Backoff schedule shared by every adapter call
    #[serde(default)]
    pub retry: RetryConfig,
    /// Streaming freshness and fallback parameters
    #[serde(default)]
    pub streams: StreamConfig,
    /// Venue id to venue settings
    #[serde(default)]
    pub venues: HashMap<String, VenueConfig>,
    /// Fiat conversion source
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiet period before an operation forces a fresh book fetch
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Quiet period before an operation is reported as stalled
    #[serde(default = "default_stalled_secs")]
    pub stalled_secs: u64,
    /// Cooldown before an order may return to the best price
    #[serde(default = "default_go_back_secs")]
    pub go_back_secs: u64,
    /// Interval between open-order counts
    #[serde(default = "default_order_count_interval_secs")]
    pub order_count_interval_secs: u64,
    /// Delay between automations started at boot
    #[serde(default = "default_startup_stagger_ms")]
    pub startup_stagger_ms: u64,
    /// Order book levels requested per side
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_short_delay_secs")]
    pub short_delay_secs: u64,
    #[serde(default = "default_long_delay_secs")]
    pub long_delay_secs: u64,
    /// Retries that wait the short delay
    #[serde(default = "default_short_attempts")]
    pub short_attempts: u32,
    /// Retry cap for reads and cancels
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry cap for order placement, unless the venue overrides it
    #[serde(default = "default_max_place_attempts")]
    pub max_place_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pushed quotes older than this are replaced by a REST snapshot
    #[serde(default = "default_quote_max_age_ms")]
    pub quote_max_age_ms: u64,
    #[serde(default = "default_book_max_age_ms")]
    pub book_max_age_ms: u64,
    #[serde(default = "default_trade_max_age_ms")]
    pub trade_max_age_ms: u64,
    /// Silence after which the quote channel falls back to polling
    #[serde(default = "default_quote_stall_ms")]
    pub quote_stall_ms: u64,
    #[serde(default = "default_book_stall_ms")]
    pub book_stall_ms: u64,
    #[serde(default = "default_trade_stall_ms")]
    pub trade_stall_ms: u64,
    /// Interval used by venues without push streams
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Channel a stream carries, used to pick its freshness limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Quote,
    Book,
    Trades,
}

impl StreamConfig {
    pub fn max_age(&self, channel: Channel) -> Duration {
        Duration::from_millis(match channel {
            Channel::Quote => self.quote_max_age_ms,
            Channel::Book => self.book_max_age_ms,
            Channel::Trades => self.trade_max_age_ms,
        })
    }

    pub fn stall_timeout(&self, channel: Channel) -> Duration {
        Duration::from_millis(match channel {
            Channel::Quote => self.quote_stall_ms,
            Channel::Book => self.book_stall_ms,
            Channel::Trades => self.trade_stall_ms,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Mercado,
    Binance,
    Mock,
}

impl VenueKind {
    fn default_rate_limit(self) -> usize {
        match self {
            VenueKind::Mercado => 1650,
            VenueKind::Binance | VenueKind::Mock => 1200,
        }
    }

    /// Mercado keeps orders in a processing state for a while, so placement
    /// gets a longer budget there.
    fn default_place_attempts(self) -> Option<u32> {
        match self {
            VenueKind::Mercado => Some(15),
            VenueKind::Binance | VenueKind::Mock => None,
        }
    }
}

impl VenueConfig {
    /// Requests allowed per rate window.
    pub fn rate_limit(&self) -> usize {
        self.rate_limit.unwrap_or_else(|| self.kind.default_rate_limit())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub kind: VenueKind,
    /// API key (or login for venues with session auth)
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
    /// Fee/spread offset applied when pricing hedges on this venue (0.0-1.0)
    #[serde(default)]
    pub percentage: Decimal,
    #[serde(default)]
    pub testnet: bool,
    /// Requests allowed per rate window; defaults per venue kind
    #[serde(default)]
    pub rate_limit: Option<usize>,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Overrides `retry.max_place_attempts` for this venue
    #[serde(default)]
    pub max_place_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Fixed rate; disables streaming when set
    #[serde(default)]
    pub fixed_rate: Option<Decimal>,
    /// Venue streaming the reference pair
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default = "default_conversion_symbol")]
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

// Default value functions
fn default_keep_alive_secs() -> u64 {
    180
}

fn default_stalled_secs() -> u64 {
    300
}

fn default_go_back_secs() -> u64 {
    30
}

fn default_order_count_interval_secs() -> u64 {
    180
}

fn default_startup_stagger_ms() -> u64 {
    1500 // avoids a burst of requests when many automations load at once
}

fn default_book_depth() -> usize {
    50
}

fn default_short_delay_secs() -> u64 {
    3
}

fn default_long_delay_secs() -> u64 {
    15
}

fn default_short_attempts() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    15
}

fn default_max_place_attempts() -> u32 {
    5
}

fn default_quote_max_age_ms() -> u64 {
    1500
}

fn default_book_max_age_ms() -> u64 {
    1200
}

fn default_trade_max_age_ms() -> u64 {
    5000
}

fn default_quote_stall_ms() -> u64 {
    10_000
}

fn default_book_stall_ms() -> u64 {
    10_000
}

fn default_trade_stall_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_rate_window_ms() -> u64 {
    60_000
}

fn default_conversion_symbol() -> String {
    "USDT/BRL".to_string()
}

fn default_db_path() -> String {
    "data/automations.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CVM"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.engine.stalled_secs > self.engine.keep_alive_secs,
            "stalled_secs must be greater than keep_alive_secs"
        );

        anyhow::ensure!(self.engine.book_depth > 0, "book_depth must be positive");

        anyhow::ensure!(
            self.retry.short_delay_secs <= self.retry.long_delay_secs,
            "short_delay_secs must not exceed long_delay_secs"
        );

        for (id, venue) in &self.venues {
            anyhow::ensure!(
                venue.percentage >= Decimal::ZERO && venue.percentage < Decimal::ONE,
                "venue {} percentage must be in [0, 1)",
                id
            );
            anyhow::ensure!(
                venue.rate_limit() > 0 && venue.rate_window_ms > 0,
                "venue {} rate limit must be non-zero",
                id
            );
        }

        match (&self.conversion.fixed_rate, &self.conversion.venue) {
            (Some(rate), _) => {
                anyhow::ensure!(*rate > Decimal::ZERO, "conversion fixed_rate must be positive")
            }
            (None, Some(venue)) => anyhow::ensure!(
                self.venues.contains_key(venue),
                "conversion venue {} is not configured",
                venue
            ),
            (None, None) => {}
        }

        Ok(())
    }

    /// Placement retry cap for a venue.
    pub fn max_place_attempts(&self, venue_id: &str) -> u32 {
        self.venues
            .get(venue_id)
            .and_then(|v| v.max_place_attempts.or_else(|| v.kind.default_place_attempts()))
            .unwrap_or(self.retry.max_place_attempts)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            stalled_secs: default_stalled_secs(),
            go_back_secs: default_go_back_secs(),
            order_count_interval_secs: default_order_count_interval_secs(),
            startup_stagger_ms: default_startup_stagger_ms(),
            book_depth: default_book_depth(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            short_delay_secs: default_short_delay_secs(),
            long_delay_secs: default_long_delay_secs(),
            short_attempts: default_short_attempts(),
            max_attempts: default_max_attempts(),
            max_place_attempts: default_max_place_attempts(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quote_max_age_ms: default_quote_max_age_ms(),
            book_max_age_ms: default_book_max_age_ms(),
            trade_max_age_ms: default_trade_max_age_ms(),
            quote_stall_ms: default_quote_stall_ms(),
            book_stall_ms: default_book_stall_ms(),
            trade_stall_ms: default_trade_stall_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            fixed_rate: None,
            venue: None,
            symbol: default_conversion_symbol(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

impl VenueConfig {
    /// Settings for an in-memory venue.
    pub fn mock(percentage: Decimal) -> Self {
        Self {
            kind: VenueKind::Mock,
            api_key: String::new(),
            secret: String::new(),
            percentage,
            testnet: false,
            rate_limit: None,
            rate_window_ms: default_rate_window_ms(),
            max_place_attempts: None,
        }
    }
}
