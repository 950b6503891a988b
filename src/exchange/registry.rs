//! Venue registry.
//!
//! A venue becomes usable only after its markets are loaded and a balance
//! fetch proves the credentials work.

use super::binance::BinanceClient;
use super::error::ExchangeError;
use super::mercado::MercadoClient;
use super::mock::MockExchange;
use super::paper::PaperExchange;
use super::retry::{with_retry, CallSite, RetryPolicy};
use super::traits::{ExchangeAdapter, ExchangeResult};
use super::types::Market;
use crate::config::{Config, RetryConfig, VenueConfig, VenueKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Ready venues keyed by configured id.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    venues: HashMap<String, Arc<dyn ExchangeAdapter>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and set up every configured venue.
    ///
    /// Venues that fail setup are logged and left out; automations that
    /// reference them will fail to start.
    pub async fn from_config(config: &Config, paper: bool) -> Self {
        let mut registry = Self::new();
        for (id, venue_config) in &config.venues {
            let adapter = match build_adapter(id, venue_config, &config.retry, paper) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(venue = %id, error = %e, "Failed to build venue client");
                    continue;
                }
            };
            match setup_venue(adapter.as_ref(), &config.retry).await {
                Ok(()) => registry.insert(adapter),
                Err(e) => error!(venue = %id, error = %e, "Venue setup failed"),
            }
        }
        registry
    }

    pub fn insert(&mut self, venue: Arc<dyn ExchangeAdapter>) {
        self.venues.insert(venue.venue_id().to_string(), venue);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.venues.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.venues.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Market metadata for `symbol` on venue `id`, or why it is unavailable.
    pub fn market(&self, id: &str, symbol: &str) -> ExchangeResult<Market> {
        let venue = self
            .get(id)
            .ok_or_else(|| ExchangeError::InvalidSymbol(format!("venue {} is not enabled", id)))?;
        venue
            .market(symbol)
            .ok_or_else(|| ExchangeError::InvalidSymbol(format!("{} is not listed on {}", symbol, id)))
    }
}

/// Construct the adapter for one configured venue.
pub fn build_adapter(
    id: &str,
    config: &VenueConfig,
    retry: &RetryConfig,
    paper: bool,
) -> ExchangeResult<Arc<dyn ExchangeAdapter>> {
    let live: Arc<dyn ExchangeAdapter> = match config.kind {
        VenueKind::Mercado => Arc::new(MercadoClient::new(id, config, retry)?),
        VenueKind::Binance => Arc::new(BinanceClient::new(id, config)?),
        VenueKind::Mock => return Ok(Arc::new(MockExchange::new(id, config.percentage))),
    };
    if paper {
        info!(venue = %id, "Paper trading: orders are simulated");
        return Ok(Arc::new(PaperExchange::new(live)));
    }
    Ok(live)
}

/// Load markets and check credentials, retrying transient failures.
pub async fn setup_venue(venue: &dyn ExchangeAdapter, retry: &RetryConfig) -> ExchangeResult<()> {
    let policy = RetryPolicy::reads(retry);
    let id = venue.venue_id();

    let markets = with_retry(&policy, CallSite::new("load_markets", id, "*"), || venue.load_markets()).await?;
    with_retry(&policy, CallSite::new("fetch_balance", id, "*"), || venue.fetch_balance()).await?;

    info!(venue = %id, markets = markets.len(), "Venue ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_setup_retries_transient_failures() {
        let venue = MockExchange::new("binance", dec!(0.001));
        venue.add_market("BTC/USDT", None);
        venue.fail_next("fetch_balance", ExchangeError::Network("reset".into()), 2);

        setup_venue(&venue, &RetryConfig::default()).await.unwrap();
        assert_eq!(venue.count("fetch_balance"), 3);
    }

    #[tokio::test]
    async fn test_setup_rejects_bad_credentials() {
        let venue = MockExchange::new("binance", dec!(0.001));
        venue.fail_next("fetch_balance", ExchangeError::Auth("invalid key".into()), 1);

        let err = setup_venue(&venue, &RetryConfig::default()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[tokio::test]
    async fn test_registry_market_lookup() {
        let venue = Arc::new(MockExchange::new("mercado", dec!(0.003)));
        venue.add_market("BTC/BRL", Some(dec!(0.00001)));
        let mut registry = VenueRegistry::new();
        registry.insert(venue);

        assert!(registry.market("mercado", "BTC/BRL").is_ok());
        assert!(registry.market("mercado", "ETH/BRL").is_err());
        assert!(registry.market("binance", "BTC/USDT").is_err());
        assert_eq!(registry.ids(), vec!["mercado".to_string()]);
    }
}
