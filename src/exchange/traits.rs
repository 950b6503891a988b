//! Venue-agnostic adapter contract.
//!
//! The engine only ever talks to venues through [`ExchangeAdapter`]. Every
//! call returns normalized shapes and classifies failures with
//! [`ExchangeError`], so retry decisions do not depend on the venue.

use crate::config::StreamConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::stream::{polling_stream, MarketStream, STREAM_BUFFER};
use crate::exchange::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Operations any venue integration must support.
///
/// Streaming methods default to REST polling; venues with push feeds
/// override them.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    /// Configured venue id, e.g. `mercado`.
    fn venue_id(&self) -> &str;

    /// Fee/spread offset applied when pricing hedges on this venue.
    fn percentage(&self) -> Decimal;

    /// Fetch and cache market metadata.
    async fn load_markets(&self) -> ExchangeResult<Markets>;

    /// Cached metadata for `symbol`, if markets are loaded.
    fn market(&self, symbol: &str) -> Option<Market>;

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<Quote>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ExchangeResult<OrderBook>;

    /// Most recent public trades, oldest first.
    async fn fetch_trades(&self, symbol: &str) -> ExchangeResult<Vec<Trade>>;

    /// Place a limit order. The returned order always carries the venue id.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order>;

    /// Cancel an order, returning its final state.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>>;

    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>>;

    fn watch_quotes(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Quote> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:quote", self.venue_id(), symbol);
        polling_stream(label, config.poll_interval(), move || {
            let venue = Arc::clone(&self);
            let symbol = symbol.clone();
            async move { venue.fetch_quote(&symbol).await }
        })
    }

    fn watch_order_book(
        self: Arc<Self>,
        symbol: &str,
        depth: usize,
        config: &StreamConfig,
    ) -> MarketStream<OrderBook> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:book", self.venue_id(), symbol);
        polling_stream(label, config.poll_interval(), move || {
            let venue = Arc::clone(&self);
            let symbol = symbol.clone();
            async move { venue.fetch_order_book(&symbol, depth).await }
        })
    }

    /// Public trade tape. The polling fallback only emits trades newer than
    /// the last one it has seen.
    fn watch_trades(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Trade> {
        let symbol = symbol.to_string();
        let interval = config.poll_interval();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let producer = tokio::spawn(async move {
            let mut seen: Option<DateTime<Utc>> = None;
            loop {
                match self.fetch_trades(&symbol).await {
                    Ok(trades) => {
                        let fresh: Vec<Trade> = trades
                            .into_iter()
                            .filter(|t| seen.map_or(true, |ts| t.timestamp > ts))
                            .collect();
                        // the first poll only sets the watermark
                        let first_poll = seen.is_none();
                        if let Some(last) = fresh.last() {
                            seen = Some(last.timestamp);
                        } else if first_poll {
                            seen = Some(Utc::now());
                        }
                        if !first_poll {
                            for trade in fresh {
                                if tx.send(trade).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => debug!(venue = self.venue_id(), symbol = %symbol, error = %e, "Trade poll failed"),
                }
                tokio::time::sleep(interval).await;
            }
        });
        MarketStream::new(rx, producer)
    }
}
