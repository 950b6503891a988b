//! Paper trading venue.
//!
//! Market data comes from a live venue; orders are simulated in memory and
//! filled when the live trade tape crosses their price.

use super::mock::MockExchange;
use super::stream::{MarketStream, STREAM_BUFFER};
use super::traits::{ExchangeAdapter, ExchangeResult};
use super::types::*;
use crate::config::StreamConfig;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub struct PaperExchange {
    live: Arc<dyn ExchangeAdapter>,
    orders: MockExchange,
}

impl PaperExchange {
    pub fn new(live: Arc<dyn ExchangeAdapter>) -> Self {
        let orders = MockExchange::new(live.venue_id().to_string(), live.percentage());
        Self { live, orders }
    }

    /// Simulated order book of this venue.
    pub fn simulated(&self) -> &MockExchange {
        &self.orders
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn venue_id(&self) -> &str {
        self.live.venue_id()
    }

    fn percentage(&self) -> Decimal {
        self.live.percentage()
    }

    async fn load_markets(&self) -> ExchangeResult<Markets> {
        let markets = self.live.load_markets().await?;
        for market in markets.values() {
            self.orders.add_market(&market.symbol, market.min_amount);
        }
        Ok(markets)
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.live.market(symbol)
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<Quote> {
        self.live.fetch_quote(symbol).await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ExchangeResult<OrderBook> {
        self.live.fetch_order_book(symbol, depth).await
    }

    async fn fetch_trades(&self, symbol: &str) -> ExchangeResult<Vec<Trade>> {
        self.live.fetch_trades(symbol).await
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        self.orders.place_order(request).await
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        self.orders.fetch_order(order_id, symbol).await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        self.orders.cancel_order(order_id, symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.orders.cancel_all_orders(symbol).await
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>> {
        self.orders.fetch_open_orders(symbol).await
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>> {
        // credentials are still checked against the live venue
        self.live.fetch_balance().await
    }

    fn watch_quotes(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Quote> {
        Arc::clone(&self.live).watch_quotes(symbol, config)
    }

    fn watch_order_book(
        self: Arc<Self>,
        symbol: &str,
        depth: usize,
        config: &StreamConfig,
    ) -> MarketStream<OrderBook> {
        Arc::clone(&self.live).watch_order_book(symbol, depth, config)
    }

    fn watch_trades(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Trade> {
        let mut upstream = Arc::clone(&self.live).watch_trades(symbol, config);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let producer = tokio::spawn(async move {
            while let Some(trade) = upstream.next().await {
                for order in self.orders.cross(&trade.symbol, trade.price) {
                    info!(venue = self.venue_id(), order_id = %order.id, price = %trade.price, "Paper order filled");
                }
                if tx.send(trade).await.is_err() {
                    break;
                }
            }
        });
        MarketStream::new(rx, producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_live_trades_fill_simulated_orders() {
        let live = Arc::new(MockExchange::new("mercado", dec!(0.003)));
        let paper = Arc::new(PaperExchange::new(live.clone()));

        let order = paper
            .place_order(&OrderRequest {
                symbol: "BTC/BRL".into(),
                side: Side::Sell,
                amount: dec!(0.1),
                price: dec!(300000),
            })
            .await
            .unwrap();
        assert!(live.placements().is_empty());

        let mut trades = Arc::clone(&paper).watch_trades("BTC/BRL", &StreamConfig::default());
        live.push_trade(Trade {
            symbol: "BTC/BRL".into(),
            price: dec!(300100),
            amount: dec!(0.5),
            side: Side::Buy,
            timestamp: Utc::now(),
        });
        trades.next().await.unwrap();

        let fetched = paper.fetch_order(&order.id, "BTC/BRL").await.unwrap();
        assert!(fetched.is_closed());
        assert_eq!(paper.percentage(), dec!(0.003));
    }
}
