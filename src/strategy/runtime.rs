//! Live state and event loop of one automation.
//!
//! ## Tasks
//! - quote consumer (venue B): caches the quote and recomputes min prices
//! - book consumer (venue A): starts a book pass unless one is running
//! - trade consumer (venue A): flags operations whose price was crossed
//! - watchdog consumer: reacts to expired operation timers
//! - order counter: periodically counts open orders on venue A
//!
//! The book pass is the only code that drives orders. It holds the `busy`
//! flag for its whole duration; book snapshots arriving meanwhile are
//! dropped. State is behind an async mutex that is never held across venue
//! calls.

use crate::config::Config;
use crate::exchange::{with_retry, CallSite, ExchangeAdapter, OrderBook, Quote, RetryPolicy, Side};
use crate::notify::{AlertLevel, Event, FieldUpdate, Notifier};
use crate::persistence::AutomationStore;
use crate::strategy::model::{Automation, CachedQuote, OperationStatus};
use crate::strategy::pricing::{compute_min_price, compute_target_price, BandParams, TargetParams};
use crate::strategy::watchdog::{WatchdogDelays, WatchdogEvent, Watchdogs};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Collaborators shared by every automation.
pub struct EngineContext {
    pub config: Arc<Config>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn AutomationStore>,
    pub conversion: watch::Receiver<Option<Decimal>>,
}

pub struct AutomationRuntime {
    id: String,
    pub(super) state: Mutex<Automation>,
    pub(super) venue_a: Arc<dyn ExchangeAdapter>,
    pub(super) venue_b: Arc<dyn ExchangeAdapter>,
    pub(super) ctx: Arc<EngineContext>,
    busy: AtomicBool,
    must_delete: AtomicBool,
    live: AtomicBool,
    pub(super) watchdogs: Watchdogs,
    watchdog_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WatchdogEvent>>>,
    shutdown: watch::Sender<bool>,
    teardown: mpsc::UnboundedSender<String>,
}

impl AutomationRuntime {
    /// Wrap a normalized automation. Nothing runs until [`start`](Self::start).
    ///
    /// Deferred deletions are requested by sending the id on `teardown`.
    pub fn new(
        automation: Automation,
        venue_a: Arc<dyn ExchangeAdapter>,
        venue_b: Arc<dyn ExchangeAdapter>,
        ctx: Arc<EngineContext>,
        teardown: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (watchdogs, watchdog_rx) = Watchdogs::new(WatchdogDelays::from(&ctx.config.engine));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: automation.id.clone(),
            state: Mutex::new(automation),
            venue_a,
            venue_b,
            ctx,
            busy: AtomicBool::new(false),
            must_delete: AtomicBool::new(false),
            live: AtomicBool::new(true),
            watchdogs,
            watchdog_rx: std::sync::Mutex::new(Some(watchdog_rx)),
            shutdown,
            teardown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> Automation {
        self.state.lock().await.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Live and not marked for deletion.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.must_delete.load(Ordering::SeqCst)
    }

    /// Mark for deletion. Returns `true` if a pass is running and teardown
    /// must wait for it.
    pub fn request_delete(&self) -> bool {
        self.must_delete.store(true, Ordering::SeqCst);
        self.is_busy()
    }

    /// Stop every consumer and timer. Returns `false` if already retired.
    pub fn retire(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);
        self.watchdogs.clear();
        true
    }

    /// Open market data feeds and start driving orders.
    ///
    /// The quote feed is primed first so the first book pass already has
    /// min prices to work with.
    pub async fn start(self: Arc<Self>) {
        let (symbol_a, symbol_b) = {
            let state = self.state.lock().await;
            (state.symbol_a.clone(), state.symbol_b.clone())
        };
        let config = &self.ctx.config;
        let policy = RetryPolicy::reads(&config.retry);
        info!(automation = %self.id, venue_a = self.venue_a.venue_id(), symbol_a = %symbol_a, venue_b = self.venue_b.venue_id(), symbol_b = %symbol_b, "Starting automation");

        self.spawn_watchdog_consumer();
        self.spawn_order_counter(&symbol_a);

        let venue_b = self.venue_b.as_ref();
        let site = CallSite::new("fetch_quote", venue_b.venue_id(), &symbol_b);
        let pair = symbol_b.as_str();
        match with_retry(&policy, site, move || venue_b.fetch_quote(pair)).await {
            Ok(quote) => self.handle_quote(&quote).await,
            Err(e) => warn!(automation = %self.id, error = %e, "Initial quote unavailable"),
        }
        let quotes = Arc::clone(&self.venue_b).watch_quotes(&symbol_b, &config.streams);
        let runtime = Arc::clone(&self);
        tokio::spawn(async move {
            let mut quotes = quotes;
            let mut shutdown = runtime.shutdown.subscribe();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    quote = quotes.next() => match quote {
                        Some(quote) => runtime.handle_quote(&quote).await,
                        None => break,
                    },
                }
            }
            debug!(automation = %runtime.id, "Quote consumer stopped");
        });

        match self.fetch_book(&symbol_a).await {
            Ok(book) => {
                self.run_pass(book).await;
            }
            Err(e) => warn!(automation = %self.id, error = %e, "Initial order book unavailable"),
        }
        let depth = config.engine.book_depth;
        let books = Arc::clone(&self.venue_a).watch_order_book(&symbol_a, depth, &config.streams);
        let runtime = Arc::clone(&self);
        tokio::spawn(async move {
            let mut books = books;
            let mut shutdown = runtime.shutdown.subscribe();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    book = books.next() => match book {
                        Some(book) => {
                            Arc::clone(&runtime).trigger_pass(book);
                        }
                        None => break,
                    },
                }
            }
            debug!(automation = %runtime.id, "Book consumer stopped");
        });

        let trades = Arc::clone(&self.venue_a).watch_trades(&symbol_a, &config.streams);
        let runtime = Arc::clone(&self);
        tokio::spawn(async move {
            let mut trades = trades;
            let mut shutdown = runtime.shutdown.subscribe();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    trade = trades.next() => match trade {
                        Some(trade) => runtime.handle_trade(trade.price).await,
                        None => break,
                    },
                }
            }
            debug!(automation = %runtime.id, "Trade consumer stopped");
        });
    }

    async fn fetch_book(&self, symbol: &str) -> crate::exchange::ExchangeResult<OrderBook> {
        let policy = RetryPolicy::reads(&self.ctx.config.retry);
        let venue = self.venue_a.as_ref();
        let depth = self.ctx.config.engine.book_depth;
        let site = CallSite::new("fetch_order_book", venue.venue_id(), symbol);
        with_retry(&policy, site, move || venue.fetch_order_book(symbol, depth)).await
    }

    /// Start a book pass in the background unless one is already running.
    pub fn trigger_pass(self: Arc<Self>, book: OrderBook) -> bool {
        if !self.is_live() || self.busy.load(Ordering::SeqCst) {
            return false;
        }
        tokio::spawn(async move { self.run_pass(book).await });
        true
    }

    /// Run book passes until no operation needs checking.
    ///
    /// Returns `false` without doing anything if a pass is already running.
    pub async fn run_pass(&self, mut book: OrderBook) -> bool {
        if !self.is_live() || self.busy.swap(true, Ordering::SeqCst) {
            return false;
        }

        let ready = {
            let state = self.state.lock().await;
            if state.ticker.is_some() {
                state.subtract_own_volume(&mut book);
                true
            } else {
                false
            }
        };

        if ready {
            loop {
                self.pass_once(&book).await;
                let again = {
                    let state = self.state.lock().await;
                    state.operations.iter().any(|op| op.must_check)
                };
                if !again || !self.is_live() {
                    break;
                }
                debug!(automation = %self.id, "Operations still need checking, iterating again");
            }
        }

        self.release();
        true
    }

    fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
        if self.must_delete.load(Ordering::SeqCst) {
            let _ = self.teardown.send(self.id.clone());
        }
    }

    /// One walk over the operations, sells first.
    async fn pass_once(&self, book: &OrderBook) {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.operations.iter().map(|op| op.id.clone()).collect()
        };

        for op_id in ids {
            if !self.is_live() {
                return;
            }
            let due = {
                let mut state = self.state.lock().await;
                let Some(op) = state.operation_mut(&op_id) else {
                    continue;
                };
                if !op.is_active() {
                    op.must_check = false;
                    continue;
                }
                let Some(min_price) = op.min_price else {
                    continue;
                };
                let params = TargetParams {
                    side: op.side,
                    min_price,
                    max_vol: op.max_vol,
                    last_price: op.last_price,
                    price_tick: op.price_tick,
                    allowed_to_go_back: op.allowed_to_go_back,
                    execution_price: op.execution_price,
                };
                let new_price = compute_target_price(book, &params);
                if let Some(price) = new_price {
                    op.last_price = Some(price);
                    debug!(automation = %self.id, operation = %op_id, side = %op.side, price = %price, "New target price");
                    self.publish_fields(
                        &op_id,
                        vec![
                            FieldUpdate::new("lastPrice", price),
                            FieldUpdate::new("status", OperationStatus::Running),
                        ],
                    );
                }
                new_price.is_some() || op.must_check
            };
            if due {
                self.operate(&op_id).await;
            }
        }
    }

    /// Cache a venue B quote and refresh min prices.
    pub async fn handle_quote(&self, quote: &Quote) {
        let rate = *self.ctx.conversion.borrow();
        let Some(rate) = rate else {
            return;
        };
        if !quote.is_usable() {
            return;
        }
        let mut state = self.state.lock().await;
        state.ticker = Some(CachedQuote::from(quote));
        let same_quote = state.same_quote_currency();

        for op in state.operations.iter_mut().filter(|op| op.fixed_min_price.is_none()) {
            let reference = match op.side {
                Side::Buy => quote.bid,
                Side::Sell => quote.ask,
            };
            let params = BandParams {
                spread: op.spread,
                execution_spread: op.execution_spread,
                previous: op.min_price,
                slippage: op.slippage,
            };
            if let Some(band) = compute_min_price(reference, rate, same_quote, &params) {
                op.min_price = Some(band.min_price);
                op.execution_price = band.execution_price;
                op.exchange_price = Some(reference);
                debug!(automation = %self.id, operation = %op.id, side = %op.side, min_price = %band.min_price, reference = %reference, "New min price");
                self.publish_fields(
                    &op.id,
                    vec![
                        FieldUpdate::new("minPrice", band.min_price),
                        FieldUpdate::new("executionPrice", band.execution_price),
                        FieldUpdate::new("exchangePrice", reference),
                    ],
                );
            }
        }
    }

    /// Flag operations a venue A trade at `price` may have filled.
    pub async fn handle_trade(&self, price: Decimal) {
        let crossed = self.state.lock().await.mark_crossed(price);
        for op_id in crossed {
            info!(automation = %self.id, operation = %op_id, price = %price, "Resting order crossed by trade");
        }
    }

    fn spawn_watchdog_consumer(self: &Arc<Self>) {
        let taken = self
            .watchdog_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut events) = taken else {
            return;
        };
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = runtime.shutdown.subscribe();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => runtime.handle_watchdog(event).await,
                        None => break,
                    },
                }
            }
        });
    }

    pub(super) async fn handle_watchdog(self: &Arc<Self>, event: WatchdogEvent) {
        if !self.is_live() {
            return;
        }
        match event {
            WatchdogEvent::KeepAlive(op_id) => {
                let symbol = {
                    let mut state = self.state.lock().await;
                    if let Some(op) = state.operation_mut(&op_id) {
                        op.must_check = true;
                    }
                    state.symbol_a.clone()
                };
                debug!(automation = %self.id, operation = %op_id, "Keep alive: fetching book after inactivity");
                match self.fetch_book(&symbol).await {
                    Ok(book) => {
                        Arc::clone(self).trigger_pass(book);
                    }
                    Err(e) => warn!(automation = %self.id, error = %e, "Keep alive book fetch failed"),
                }
            }
            WatchdogEvent::Stalled(op_id) => {
                let symbol = {
                    let state = self.state.lock().await;
                    match state.operation(&op_id) {
                        Some(op) if op.status != OperationStatus::Finished => state.symbol_a.clone(),
                        _ => return,
                    }
                };
                let minutes = self.ctx.config.engine.stalled_secs / 60;
                let reason = format!("stalled for more than {} minutes", minutes);
                // reported only; the keep-alive keeps trying to revive it
                self.publish_fields(
                    &op_id,
                    vec![
                        FieldUpdate::new("status", OperationStatus::Paused),
                        FieldUpdate::new("reason", &reason),
                    ],
                );
                self.ctx
                    .notifier
                    .alert(AlertLevel::Error, format!("({}) operation {} {}", symbol, op_id, reason));
            }
            WatchdogEvent::GoBack(op_id) => {
                let mut state = self.state.lock().await;
                if let Some(op) = state.operation_mut(&op_id) {
                    op.allowed_to_go_back = true;
                    debug!(automation = %self.id, operation = %op_id, "Going back to best price");
                }
            }
        }
    }

    fn spawn_order_counter(self: &Arc<Self>, symbol: &str) {
        let runtime = Arc::clone(self);
        let symbol = symbol.to_string();
        let period = Duration::from_secs(self.ctx.config.engine.order_count_interval_secs);
        tokio::spawn(async move {
            let mut shutdown = runtime.shutdown.subscribe();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => runtime.count_open_orders(&symbol).await,
                }
            }
        });
    }

    pub(super) async fn count_open_orders(&self, symbol: &str) {
        let policy = RetryPolicy::reads(&self.ctx.config.retry);
        let venue = self.venue_a.as_ref();
        let site = CallSite::new("fetch_open_orders", venue.venue_id(), symbol);
        match with_retry(&policy, site, move || venue.fetch_open_orders(symbol)).await {
            Ok(orders) => {
                let count = orders.len();
                self.state.lock().await.order_count = count;
                self.ctx.notifier.publish(Event::AutomationField {
                    automation_id: self.id.clone(),
                    field: "orderCount",
                    value: count.into(),
                });
            }
            Err(e) => warn!(automation = %self.id, error = %e, "Open order count failed"),
        }
    }

    pub(super) fn publish_fields(&self, op_id: &str, fields: Vec<FieldUpdate>) {
        self.ctx.notifier.publish(Event::Operation {
            automation_id: self.id.clone(),
            operation_id: op_id.to_string(),
            fields,
        });
    }

    pub(super) async fn publish_snapshot(&self) {
        let snapshot = self.snapshot().await;
        self.ctx.notifier.publish(Event::Automation {
            automation: Box::new(snapshot),
        });
    }

    /// Save the current record while the automation is still registered.
    pub(super) async fn persist(&self) {
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        let snapshot = self.snapshot().await;
        if let Err(e) = self.ctx.store.save(&snapshot) {
            error!(automation = %self.id, error = %e, "Failed to persist automation");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::exchange::{BookLevel, MockExchange};
    use crate::notify::BroadcastNotifier;
    use crate::persistence::MockAutomationStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    pub struct Harness {
        pub runtime: Arc<AutomationRuntime>,
        pub venue_a: Arc<MockExchange>,
        pub venue_b: Arc<MockExchange>,
        pub notifier: Arc<BroadcastNotifier>,
        pub teardown: mpsc::UnboundedReceiver<String>,
    }

    pub fn quote(symbol: &str, bid: Decimal, ask: Decimal) -> Quote {
        Quote {
            symbol: symbol.into(),
            bid,
            ask,
            last: (bid + ask) / dec!(2),
            timestamp: Utc::now(),
        }
    }

    pub fn book(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> OrderBook {
        let levels = |side: &[(Decimal, Decimal)]| side.iter().map(|&(p, s)| BookLevel::new(p, s)).collect();
        OrderBook::new("BTC/BRL", levels(bids), levels(asks))
    }

    pub fn store() -> MockAutomationStore {
        let mut store = MockAutomationStore::new();
        store.expect_save().returning(|_| Ok(()));
        store.expect_delete().returning(|_| Ok(()));
        store
    }

    pub fn context(store: MockAutomationStore, rate: Option<Decimal>, notifier: Arc<BroadcastNotifier>) -> Arc<EngineContext> {
        let (_, conversion) = watch::channel(rate);
        Arc::new(EngineContext {
            config: Arc::new(Config::default()),
            notifier,
            store: Arc::new(store),
            conversion,
        })
    }

    /// Hold the pass flag as if a book pass were running.
    pub fn occupy(runtime: &AutomationRuntime) {
        runtime.busy.store(true, Ordering::SeqCst);
    }

    /// End the simulated pass, handing off a deferred teardown.
    pub fn vacate(runtime: &AutomationRuntime) {
        runtime.release();
    }

    /// Runtime over two mock venues with a cached venue B quote.
    pub async fn harness(automation: Automation) -> Harness {
        let venue_a = Arc::new(MockExchange::new("mercado", Decimal::ZERO));
        venue_a.add_market("BTC/BRL", None);
        let venue_b = Arc::new(MockExchange::new("binance", dec!(0.001)));
        venue_b.add_market("BTC/USDT", Some(dec!(0.0001)));
        let notifier = Arc::new(BroadcastNotifier::new());
        let ctx = context(store(), Some(dec!(5)), notifier.clone());
        let (tx, teardown) = mpsc::unbounded_channel();

        let runtime = AutomationRuntime::new(automation, venue_a.clone(), venue_b.clone(), ctx, tx);
        runtime.state.lock().await.ticker = Some(CachedQuote {
            bid: dec!(100),
            ask: dec!(101),
        });
        Harness {
            runtime,
            venue_a,
            venue_b,
            notifier,
            teardown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::exchange::MockCall;
    use crate::strategy::model::fixtures::{automation, operation};
    use rust_decimal_macros::dec;

    fn buy_leg() -> Automation {
        let mut buy = operation("buy", Side::Buy, dec!(1));
        buy.amount = dec!(1);
        buy.remaining = dec!(1);
        buy.min_price = Some(dec!(99.5));
        buy.max_vol = dec!(200);
        automation(vec![buy])
    }

    #[tokio::test]
    async fn test_quote_sets_min_price_with_conversion() {
        let h = harness(automation(vec![
            operation("sell", Side::Sell, dec!(1)),
            operation("buy", Side::Buy, dec!(1)),
        ]))
        .await;

        h.runtime.handle_quote(&quote("BTC/USDT", dec!(20), dec!(21))).await;

        let state = h.runtime.snapshot().await;
        let buy = state.operation("buy").unwrap();
        // 20 * 5 * 0.99
        assert_eq!(buy.min_price, Some(dec!(99)));
        assert_eq!(buy.exchange_price, Some(dec!(20)));
        let sell = state.operation("sell").unwrap();
        // 21 * 5 * 1.01
        assert_eq!(sell.min_price, Some(dec!(106.05)));
        assert_eq!(state.ticker, Some(CachedQuote { bid: dec!(20), ask: dec!(21) }));
    }

    #[tokio::test]
    async fn test_quote_ignored_without_rate() {
        let venue = Arc::new(crate::exchange::MockExchange::new("x", Decimal::ZERO));
        let notifier = Arc::new(crate::notify::BroadcastNotifier::new());
        let ctx = context(store(), None, notifier);
        let (tx, _rx) = mpsc::unbounded_channel();
        let runtime = AutomationRuntime::new(buy_leg(), venue.clone(), venue, ctx, tx);

        runtime.handle_quote(&quote("BTC/USDT", dec!(20), dec!(21))).await;
        assert!(runtime.snapshot().await.ticker.is_none());
    }

    #[tokio::test]
    async fn test_fixed_min_price_is_kept() {
        let mut automation = buy_leg();
        automation.operations[0].fixed_min_price = Some(dec!(99.5));
        let h = harness(automation).await;

        h.runtime.handle_quote(&quote("BTC/USDT", dec!(30), dec!(31))).await;
        assert_eq!(h.runtime.snapshot().await.operations[0].min_price, Some(dec!(99.5)));
    }

    #[tokio::test]
    async fn test_book_pass_places_first_order() {
        let h = harness(buy_leg()).await;

        let ran = h
            .runtime
            .run_pass(book(&[(dec!(99), dec!(5))], &[(dec!(100), dec!(1))]))
            .await;
        assert!(ran);

        let placements = h.venue_a.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].price, dec!(99.01));
        assert_eq!(placements[0].amount, dec!(1));

        let op = h.runtime.snapshot().await.operations[0].clone();
        assert_eq!(op.last_price, Some(dec!(99.01)));
        assert!(op.order_id.is_some());
        assert!(!h.runtime.is_busy());
    }

    #[tokio::test]
    async fn test_book_dropped_while_busy() {
        let h = harness(buy_leg()).await;
        h.runtime.busy.store(true, Ordering::SeqCst);

        let book = book(&[(dec!(99), dec!(5))], &[]);
        assert!(!h.runtime.run_pass(book.clone()).await);
        assert!(!Arc::clone(&h.runtime).trigger_pass(book));
        assert_eq!(h.venue_a.count("place_order"), 0);
    }

    #[tokio::test]
    async fn test_pass_waits_for_quote() {
        let h = harness(buy_leg()).await;
        h.runtime.state.lock().await.ticker = None;

        assert!(h.runtime.run_pass(book(&[(dec!(99), dec!(5))], &[])).await);
        assert_eq!(h.venue_a.count("place_order"), 0);
        assert!(!h.runtime.is_busy());
    }

    #[tokio::test]
    async fn test_own_volume_is_not_competed_with() {
        let h = harness(buy_leg()).await;
        h.runtime
            .run_pass(book(&[(dec!(99), dec!(5))], &[(dec!(100), dec!(1))]))
            .await;
        h.venue_a.clear_calls();

        // our own 1 @ 99.01 now sits on top of the book
        let next = book(&[(dec!(99.01), dec!(1)), (dec!(99), dec!(5))], &[(dec!(100), dec!(1))]);
        h.runtime.run_pass(next).await;
        assert_eq!(h.venue_a.count("place_order"), 0);
    }

    #[tokio::test]
    async fn test_deferred_delete_after_pass() {
        let mut h = harness(buy_leg()).await;
        h.runtime.busy.store(true, Ordering::SeqCst);
        assert!(h.runtime.request_delete());

        h.runtime.release();
        assert_eq!(h.teardown.recv().await.as_deref(), Some("auto-1"));
        assert!(!h.runtime.is_live());
    }

    #[tokio::test]
    async fn test_trade_flags_crossed_operation() {
        let h = harness(buy_leg()).await;
        {
            let mut state = h.runtime.state.lock().await;
            state.operations[0].last_price = Some(dec!(99.01));
        }
        h.runtime.handle_trade(dec!(99.5)).await;
        assert!(!h.runtime.snapshot().await.operations[0].must_check);

        h.runtime.handle_trade(dec!(99)).await;
        assert!(h.runtime.snapshot().await.operations[0].must_check);
    }

    #[tokio::test]
    async fn test_stalled_reports_without_mutating() {
        let h = harness(buy_leg()).await;
        let mut events = h.notifier.subscribe();

        h.runtime
            .handle_watchdog(WatchdogEvent::Stalled("buy".into()))
            .await;

        assert_eq!(h.runtime.snapshot().await.operations[0].status, OperationStatus::Running);
        assert!(matches!(events.recv().await.unwrap(), Event::Operation { .. }));
        assert_eq!(h.notifier.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_order_count_published() {
        let h = harness(buy_leg()).await;
        let mut events = h.notifier.subscribe();
        h.runtime
            .run_pass(book(&[(dec!(99), dec!(5))], &[(dec!(100), dec!(1))]))
            .await;

        h.runtime.count_open_orders("BTC/BRL").await;
        assert_eq!(h.runtime.snapshot().await.order_count, 1);
        let mut counted = false;
        while let Ok(event) = events.try_recv() {
            if let Event::AutomationField { field: "orderCount", value, .. } = event {
                assert_eq!(value, 1);
                counted = true;
            }
        }
        assert!(counted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_primes_quote_then_places() {
        let mut automation = automation(vec![operation("buy", Side::Buy, dec!(1))]);
        automation.normalize_for_start();
        let h = harness(automation).await;
        h.runtime.state.lock().await.ticker = None;
        h.venue_b.set_quote(quote("BTC/USDT", dec!(20), dec!(21)));
        // min price 20 * 5 * 0.99 = 99
        h.venue_a.set_order_book(book(&[(dec!(99.5), dec!(5)), (dec!(98.5), dec!(5))], &[(dec!(100), dec!(1))]));

        Arc::clone(&h.runtime).start().await;

        let placements = h.venue_a.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].price, dec!(98.51));
        assert_eq!(placements[0].amount, dec!(100));

        assert!(h.runtime.retire());
        assert!(!h.runtime.retire());
    }

    #[tokio::test]
    async fn test_pass_drives_sells_first_and_repeats_for_rebalanced_legs() {
        let mut buy = operation("buy", Side::Buy, dec!(1));
        buy.remaining = dec!(1);
        buy.fixed_min_price = Some(dec!(99.5));
        let mut sell = operation("sell", Side::Sell, dec!(1));
        sell.remaining = dec!(0.5);
        sell.fixed_min_price = Some(dec!(101));
        let mut automation = automation(vec![buy, sell]);
        automation.normalize_for_start();
        let h = harness(automation).await;

        h.runtime.state.lock().await.operations[1].last_price = Some(dec!(99.01));
        h.runtime.operate("buy").await;
        let order_id = h.runtime.snapshot().await.operations[1].order_id.clone().unwrap();
        h.venue_a.fill(&order_id, dec!(1));
        h.venue_a.clear_calls();
        {
            let mut state = h.runtime.state.lock().await;
            state.operations[0].last_price = Some(dec!(101.99));
            for op in &mut state.operations {
                op.must_check = true;
            }
        }

        assert!(h.runtime.run_pass(book(&[(dec!(99), dec!(5))], &[(dec!(102), dec!(5))])).await);

        let names: Vec<&str> = h.venue_a.calls().iter().map(MockCall::name).collect();
        assert_eq!(
            names,
            vec![
                // first walk: sell placed, then the filled buy found
                "place_order",
                "fetch_order",
                // second walk: the sell grown by the hedge is repositioned
                "fetch_order",
                "cancel_order",
                "fetch_order",
                "place_order",
            ]
        );
        let placements = h.venue_a.placements();
        assert!(placements.iter().all(|p| p.side == Side::Sell));
        assert_eq!(placements[0].amount, dec!(0.5));
        assert_eq!(placements[1].amount, dec!(1.5));

        let state = h.runtime.snapshot().await;
        assert!(state.operations.iter().all(|op| !op.must_check));
        assert_eq!(state.operation("buy").unwrap().status, OperationStatus::Finished);
        assert!(!h.runtime.is_busy());
    }
}
