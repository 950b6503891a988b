//! In-memory venue for tests and paper trading.
//!
//! Orders rest until filled by [`MockExchange::fill`] or by a trade crossing
//! their price. Every adapter call is recorded, and failures can be scripted
//! per call name.

use super::error::ExchangeError;
use super::stream::{MarketStream, STREAM_BUFFER};
use super::traits::{ExchangeAdapter, ExchangeResult};
use super::types::*;
use crate::config::StreamConfig;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A recorded adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    LoadMarkets,
    FetchQuote(String),
    FetchOrderBook(String),
    FetchTrades(String),
    PlaceOrder(OrderRequest),
    FetchOrder(String),
    CancelOrder(String),
    CancelAllOrders(String),
    FetchOpenOrders(String),
    FetchBalance,
}

impl MockCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadMarkets => "load_markets",
            Self::FetchQuote(_) => "fetch_quote",
            Self::FetchOrderBook(_) => "fetch_order_book",
            Self::FetchTrades(_) => "fetch_trades",
            Self::PlaceOrder(_) => "place_order",
            Self::FetchOrder(_) => "fetch_order",
            Self::CancelOrder(_) => "cancel_order",
            Self::CancelAllOrders(_) => "cancel_all_orders",
            Self::FetchOpenOrders(_) => "fetch_open_orders",
            Self::FetchBalance => "fetch_balance",
        }
    }
}

#[derive(Default)]
struct MockState {
    markets: Markets,
    quotes: HashMap<String, Quote>,
    books: HashMap<String, OrderBook>,
    trades: HashMap<String, Vec<Trade>>,
    orders: HashMap<String, Order>,
    /// Placement order of ids, used for deterministic listings
    order_seq: Vec<String>,
    balances: Vec<Balance>,
    next_id: u64,
    calls: Vec<MockCall>,
    failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    /// Fill applied to an order when it is canceled
    fill_on_cancel: HashMap<String, Decimal>,
    quote_subs: Vec<mpsc::Sender<Quote>>,
    book_subs: Vec<mpsc::Sender<OrderBook>>,
    trade_subs: Vec<mpsc::Sender<Trade>>,
}

impl MockState {
    fn record(&mut self, call: MockCall) -> ExchangeResult<()> {
        let name = call.name();
        self.calls.push(call);
        match self.failures.get_mut(name).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_fill(&mut self, order_id: &str, amount: Decimal) -> Option<Order> {
        let order = self.orders.get_mut(order_id)?;
        if matches!(order.status, OrderStatus::Closed | OrderStatus::Canceled) {
            return Some(order.clone());
        }
        let qty = amount.min(order.remaining);
        order.filled += qty;
        order.remaining -= qty;
        if order.remaining.is_zero() {
            order.status = OrderStatus::Closed;
        }
        Some(order.clone())
    }
}

/// In-memory venue implementing the full adapter contract.
pub struct MockExchange {
    id: String,
    percentage: Decimal,
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(id: impl Into<String>, percentage: Decimal) -> Self {
        Self {
            id: id.into(),
            percentage,
            state: Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a market with an optional minimum order size.
    pub fn add_market(&self, symbol: &str, min_amount: Option<Decimal>) {
        let (base, quote) = split_symbol(symbol).unwrap_or((symbol, ""));
        let market = Market {
            symbol: symbol.to_string(),
            id: symbol.replace('/', ""),
            base: base.to_string(),
            quote: quote.to_string(),
            active: true,
            min_amount,
            min_notional: None,
            amount_step: None,
        };
        self.state().markets.insert(symbol.to_string(), market);
    }

    /// Make a registered market trade in multiples of `step`.
    pub fn set_amount_step(&self, symbol: &str, step: Decimal) {
        if let Some(market) = self.state().markets.get_mut(symbol) {
            market.amount_step = Some(step);
        }
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        let mut state = self.state();
        state.balances.retain(|b| b.asset != asset);
        state.balances.push(Balance {
            asset: asset.to_string(),
            free,
            used: Decimal::ZERO,
            total: free,
        });
    }

    pub fn set_quote(&self, quote: Quote) {
        self.state().quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn set_order_book(&self, book: OrderBook) {
        self.state().books.insert(book.symbol.clone(), book);
    }

    /// Make the next `count` calls named `call` fail with `error`.
    pub fn fail_next(&self, call: &'static str, error: ExchangeError, count: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(call).or_default();
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Fill `amount` of an order when it gets canceled, simulating a race.
    pub fn fill_on_cancel(&self, order_id: &str, amount: Decimal) {
        self.state()
            .fill_on_cancel
            .insert(order_id.to_string(), amount);
    }

    /// Execute `amount` of a resting order.
    pub fn fill(&self, order_id: &str, amount: Decimal) -> Option<Order> {
        self.state().apply_fill(order_id, amount)
    }

    /// Mark an order as canceled on the venue side.
    pub fn cancel_externally(&self, order_id: &str) {
        if let Some(order) = self.state().orders.get_mut(order_id) {
            order.status = OrderStatus::Canceled;
        }
    }

    /// Drop an order from the venue, as if it had been lost.
    pub fn forget_order(&self, order_id: &str) {
        self.state().orders.remove(order_id);
    }

    /// Fully fill every resting order that a trade at `price` crosses.
    pub fn cross(&self, symbol: &str, price: Decimal) -> Vec<Order> {
        let mut state = self.state();
        let crossed: Vec<String> = state
            .order_seq
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| o.symbol == symbol && matches!(o.status, OrderStatus::Open))
            .filter(|o| match (o.side, o.price) {
                (Some(Side::Buy), Some(p)) => p >= price,
                (Some(Side::Sell), Some(p)) => p <= price,
                _ => false,
            })
            .map(|o| o.id.clone())
            .collect();

        crossed
            .iter()
            .filter_map(|id| {
                let remaining = state.orders.get(id)?.remaining;
                state.apply_fill(id, remaining)
            })
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state().orders.get(order_id).cloned()
    }

    /// Orders still resting, in placement order.
    pub fn open_orders(&self) -> Vec<Order> {
        let state = self.state();
        state
            .order_seq
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| matches!(o.status, OrderStatus::Open | OrderStatus::Pending))
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls named `call`.
    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| c.name() == call).count()
    }

    /// Recorded placement requests.
    pub fn placements(&self) -> Vec<OrderRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::PlaceOrder(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Deliver a quote to every quote subscriber.
    pub fn push_quote(&self, quote: Quote) {
        let mut state = self.state();
        state.quotes.insert(quote.symbol.clone(), quote.clone());
        state.quote_subs.retain(|tx| tx.try_send(quote.clone()).is_ok() || !tx.is_closed());
    }

    pub fn push_order_book(&self, book: OrderBook) {
        let mut state = self.state();
        state.books.insert(book.symbol.clone(), book.clone());
        state.book_subs.retain(|tx| tx.try_send(book.clone()).is_ok() || !tx.is_closed());
    }

    pub fn push_trade(&self, trade: Trade) {
        let mut state = self.state();
        state
            .trades
            .entry(trade.symbol.clone())
            .or_default()
            .push(trade.clone());
        state.trade_subs.retain(|tx| tx.try_send(trade.clone()).is_ok() || !tx.is_closed());
    }
}

fn symbol_filter<T, F>(tx: mpsc::Sender<T>, symbol: String, key: F) -> mpsc::Sender<T>
where
    T: Send + 'static,
    F: Fn(&T) -> &str + Send + 'static,
{
    // subscribers only receive messages for their own symbol
    let (filtered_tx, mut rx) = mpsc::channel::<T>(STREAM_BUFFER);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if key(&msg) == symbol && tx.send(msg).await.is_err() {
                break;
            }
        }
    });
    filtered_tx
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn venue_id(&self) -> &str {
        &self.id
    }

    fn percentage(&self) -> Decimal {
        self.percentage
    }

    async fn load_markets(&self) -> ExchangeResult<Markets> {
        let mut state = self.state();
        state.record(MockCall::LoadMarkets)?;
        Ok(state.markets.clone())
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.state().markets.get(symbol).cloned()
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<Quote> {
        let mut state = self.state();
        state.record(MockCall::FetchQuote(symbol.to_string()))?;
        state
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ExchangeResult<OrderBook> {
        let mut state = self.state();
        state.record(MockCall::FetchOrderBook(symbol.to_string()))?;
        let mut book = state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;
        book.truncate(depth);
        book.timestamp = Utc::now();
        Ok(book)
    }

    async fn fetch_trades(&self, symbol: &str) -> ExchangeResult<Vec<Trade>> {
        let mut state = self.state();
        state.record(MockCall::FetchTrades(symbol.to_string()))?;
        Ok(state.trades.get(symbol).cloned().unwrap_or_default())
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let mut state = self.state();
        state.record(MockCall::PlaceOrder(request.clone()))?;

        if let Some(min) = state.markets.get(&request.symbol).and_then(|m| m.min_amount) {
            if request.amount < min {
                return Err(ExchangeError::BelowMinimum(format!(
                    "{} < {}",
                    request.amount, min
                )));
            }
        }

        let id = format!("{}-{}", self.id, state.next_id);
        state.next_id += 1;
        let order = Order {
            id: id.clone(),
            symbol: request.symbol.clone(),
            side: Some(request.side),
            price: Some(request.price),
            status: OrderStatus::Open,
            filled: Decimal::ZERO,
            remaining: request.amount,
        };
        debug!(venue = %self.id, order_id = %id, side = %request.side, price = %request.price, amount = %request.amount, "Mock order placed");
        state.orders.insert(id.clone(), order.clone());
        state.order_seq.push(id);
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<Order> {
        let mut state = self.state();
        state.record(MockCall::FetchOrder(order_id.to_string()))?;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<Order> {
        let mut state = self.state();
        state.record(MockCall::CancelOrder(order_id.to_string()))?;
        if let Some(amount) = state.fill_on_cancel.remove(order_id) {
            state.apply_fill(order_id, amount);
        }
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if matches!(order.status, OrderStatus::Open | OrderStatus::Pending) {
            order.status = OrderStatus::Canceled;
        }
        Ok(order.clone())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state();
        state.record(MockCall::CancelAllOrders(symbol.to_string()))?;
        let mut canceled = 0;
        for order in state.orders.values_mut() {
            if order.symbol == symbol && matches!(order.status, OrderStatus::Open | OrderStatus::Pending) {
                order.status = OrderStatus::Canceled;
                canceled += 1;
            }
        }
        info!(venue = %self.id, symbol, canceled, "Mock orders canceled");
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>> {
        self.state()
            .record(MockCall::FetchOpenOrders(symbol.to_string()))?;
        Ok(self
            .open_orders()
            .into_iter()
            .filter(|o| o.symbol == symbol)
            .collect())
    }

    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>> {
        let mut state = self.state();
        state.record(MockCall::FetchBalance)?;
        Ok(state.balances.clone())
    }

    fn watch_quotes(self: Arc<Self>, symbol: &str, _config: &StreamConfig) -> MarketStream<Quote> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let tx = symbol_filter(tx, symbol.to_string(), |q: &Quote| q.symbol.as_str());
        self.state().quote_subs.push(tx);
        MarketStream::from_receiver(rx)
    }

    fn watch_order_book(
        self: Arc<Self>,
        symbol: &str,
        _depth: usize,
        _config: &StreamConfig,
    ) -> MarketStream<OrderBook> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let tx = symbol_filter(tx, symbol.to_string(), |b: &OrderBook| b.symbol.as_str());
        self.state().book_subs.push(tx);
        MarketStream::from_receiver(rx)
    }

    fn watch_trades(self: Arc<Self>, symbol: &str, _config: &StreamConfig) -> MarketStream<Trade> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let tx = symbol_filter(tx, symbol.to_string(), |t: &Trade| t.symbol.as_str());
        self.state().trade_subs.push(tx);
        MarketStream::from_receiver(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: Side, amount: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/BRL".into(),
            side,
            amount,
            price,
        }
    }

    #[tokio::test]
    async fn test_place_fill_and_fetch() {
        let venue = MockExchange::new("a", Decimal::ZERO);
        let order = venue.place_order(&request(Side::Buy, dec!(2), dec!(100))).await.unwrap();

        venue.fill(&order.id, dec!(0.5));
        let fetched = venue.fetch_order(&order.id, "BTC/BRL").await.unwrap();
        assert_eq!(fetched.filled, dec!(0.5));
        assert_eq!(fetched.remaining, dec!(1.5));
        assert_eq!(fetched.status, OrderStatus::Open);

        venue.fill(&order.id, dec!(5));
        let fetched = venue.fetch_order(&order.id, "BTC/BRL").await.unwrap();
        assert!(fetched.is_closed());
        assert_eq!(fetched.amount(), dec!(2));
    }

    #[tokio::test]
    async fn test_below_minimum_rejected() {
        let venue = MockExchange::new("b", Decimal::ZERO);
        venue.add_market("BTC/USDT", Some(dec!(0.001)));
        let err = venue
            .place_order(&OrderRequest {
                symbol: "BTC/USDT".into(),
                side: Side::Sell,
                amount: dec!(0.0001),
                price: dec!(50000),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::BelowMinimum(_)));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let venue = MockExchange::new("a", Decimal::ZERO);
        venue.fail_next("fetch_balance", ExchangeError::Network("reset".into()), 2);

        assert!(venue.fetch_balance().await.is_err());
        assert!(venue.fetch_balance().await.is_err());
        assert!(venue.fetch_balance().await.is_ok());
        assert_eq!(venue.count("fetch_balance"), 3);
    }

    #[tokio::test]
    async fn test_cross_fills_resting_orders() {
        let venue = MockExchange::new("a", Decimal::ZERO);
        let buy = venue.place_order(&request(Side::Buy, dec!(1), dec!(100))).await.unwrap();
        let sell = venue.place_order(&request(Side::Sell, dec!(1), dec!(110))).await.unwrap();

        let filled = venue.cross("BTC/BRL", dec!(99.5));
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].id, buy.id);
        assert_eq!(venue.order(&sell.id).unwrap().status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_push_streams_filter_by_symbol() {
        let venue = Arc::new(MockExchange::new("a", Decimal::ZERO));
        let mut stream = Arc::clone(&venue).watch_trades("BTC/BRL", &StreamConfig::default());

        for (symbol, price) in [("ETH/BRL", dec!(10)), ("BTC/BRL", dec!(100))] {
            venue.push_trade(Trade {
                symbol: symbol.into(),
                price,
                amount: dec!(1),
                side: Side::Buy,
                timestamp: Utc::now(),
            });
        }

        let trade = stream.next().await.unwrap();
        assert_eq!(trade.price, dec!(100));
    }
}
