//! Mercado Bitcoin v4 REST client.
//!
//! All requests go through a shared rate limiter. Private calls use a bearer
//! token obtained from `/authorize` and renewed shortly before it expires.

use super::types::*;
use super::websocket::{self, WsChannel, WS_URL};
use crate::config::{Channel, RetryConfig, StreamConfig, VenueConfig};
use crate::exchange::error::ExchangeError;
use crate::exchange::rate_limiter::RateLimiter;
use crate::exchange::retry::RetryPolicy;
use crate::exchange::stream::{supervised_stream, Freshness, MarketStream};
use crate::exchange::traits::{ExchangeAdapter, ExchangeResult};
use crate::exchange::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const BASE_URL: &str = "https://api.mercadobitcoin.net/api/v4";

/// Token is renewed when it has less than this left.
const TOKEN_RENEW_MARGIN_SECS: i64 = 120;
/// Tick of the shared request queue.
const LIMITER_TICK: Duration = Duration::from_secs(1);

/// Which call an error response belongs to; some codes mean different
/// things depending on the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Public,
    Place,
    FetchOrder,
    Cancel,
    Private,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    account_id: String,
    expires_at: DateTime<Utc>,
}

/// Map an error response onto the shared taxonomy.
fn classify(status: u16, body: &str, call: CallKind, order_id: Option<&str>) -> ExchangeError {
    let parsed = ErrorBody::parse(body);
    let code = parsed.short_code();
    let message = parsed.message.clone().unwrap_or_else(|| body.to_string());

    if code == "API_GENERIC_ERROR" || matches!(status, 401 | 403 | 500..=599) {
        return ExchangeError::Network(format!("HTTP {} {}", status, code));
    }
    if status == 429 {
        return ExchangeError::RateLimited(code);
    }

    match (code.as_str(), call) {
        ("ORDER_NOT_FOUND", CallKind::FetchOrder) => ExchangeError::OrderNotFound {
            order_id: order_id.unwrap_or_default().to_string(),
        },
        // cancel sometimes reports orders it has not indexed yet
        ("ORDER_NOT_FOUND", CallKind::Cancel) => ExchangeError::Network(code),
        ("INSUFFICIENT_BALANCE", _) => ExchangeError::InsufficientFunds(message),
        ("INVALID_MIN_QUANTITY" | "EXCEEDED_COST_LIMIT", _) => ExchangeError::BelowMinimum(message),
        ("INVALID_BASE_QUOTE", _) => ExchangeError::InvalidSymbol(message),
        _ => ExchangeError::Rejected {
            code: if code.is_empty() { status.to_string() } else { code },
            message,
        },
    }
}

/// Mercado Bitcoin adapter.
pub struct MercadoClient {
    id: String,
    http: Client,
    base_url: String,
    ws_url: String,
    login: String,
    password: String,
    percentage: Decimal,
    limiter: RateLimiter,
    retry: RetryConfig,
    markets: RwLock<Markets>,
    session: Mutex<Option<Session>>,
}

impl MercadoClient {
    /// Create a new client from venue configuration.
    pub fn new(id: &str, config: &VenueConfig, retry: &RetryConfig) -> ExchangeResult<Self> {
        Self::with_urls(id, config, retry, BASE_URL, WS_URL)
    }

    pub fn with_urls(
        id: &str,
        config: &VenueConfig,
        retry: &RetryConfig,
        base_url: &str,
        ws_url: &str,
    ) -> ExchangeResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            id: id.to_string(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            login: config.api_key.clone(),
            password: config.secret.clone(),
            percentage: config.percentage,
            limiter: RateLimiter::new(
                config.rate_limit(),
                Duration::from_millis(config.rate_window_ms),
                LIMITER_TICK,
            ),
            retry: retry.clone(),
            markets: RwLock::new(Markets::new()),
            session: Mutex::new(None),
        })
    }

    /// Send a request through the rate limiter and return the raw body.
    async fn execute(
        &self,
        request: RequestBuilder,
        call: CallKind,
        order_id: Option<&str>,
    ) -> ExchangeResult<String> {
        self.limiter.acquire().await;
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &body, call, order_id));
        }
        Ok(body)
    }

    async fn public<T: DeserializeOwned>(&self, path: &str) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let body = self.execute(self.http.get(&url), CallKind::Public, None).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn private(
        &self,
        method: Method,
        path: &str,
        body: Option<&NewOrder>,
        call: CallKind,
        order_id: Option<&str>,
    ) -> ExchangeResult<String> {
        let session = self.session().await?;
        let url = format!("{}/accounts/{}{}", self.base_url, session.account_id, path);
        let mut request = self.http.request(method, &url).bearer_auth(&session.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request, call, order_id).await
    }

    /// Current session, logging in again when the token is about to expire.
    async fn session(&self) -> ExchangeResult<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.expires_at - Utc::now() > ChronoDuration::seconds(TOKEN_RENEW_MARGIN_SECS) {
                return Ok(session.clone());
            }
        }

        let policy = RetryPolicy::reads(&self.retry);
        let max = policy.max_retries.unwrap_or(self.retry.max_attempts);
        let mut attempt = 0;
        let session = loop {
            match self.authorize(guard.as_ref().map(|s| s.account_id.clone())).await {
                Ok(session) => break session,
                Err(e) if e.is_transient() && attempt < max => {
                    attempt += 1;
                    warn!(venue = %self.id, attempt, error = %e, "Failed to authenticate, retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        };

        *guard = Some(session.clone());
        Ok(session)
    }

    async fn authorize(&self, known_account: Option<String>) -> ExchangeResult<Session> {
        let url = format!("{}/authorize", self.base_url);
        let request = self.http.post(&url).json(&AuthorizeRequest {
            login: &self.login,
            password: &self.password,
        });
        let body = self.execute(request, CallKind::Private, None).await?;
        let auth: AuthorizeResponse = serde_json::from_str(&body)?;

        let account_id = match known_account {
            Some(id) => id,
            None => {
                let url = format!("{}/accounts", self.base_url);
                let request = self.http.get(&url).bearer_auth(&auth.access_token);
                let body = self.execute(request, CallKind::Private, None).await?;
                let accounts: Vec<Account> = serde_json::from_str(&body)?;
                accounts
                    .into_iter()
                    .next()
                    .map(|a| a.id)
                    .ok_or_else(|| ExchangeError::Auth("no account for credentials".into()))?
            }
        };

        info!(venue = %self.id, "Logged in");
        Ok(Session {
            token: auth.access_token,
            account_id,
            expires_at: Utc
                .timestamp_opt(auth.expiration, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    /// Venue id for `symbol`, loading markets on first use.
    async fn market_for(&self, symbol: &str) -> ExchangeResult<Market> {
        if let Some(market) = self.market(symbol) {
            return Ok(market);
        }
        let markets = self.load_markets().await?;
        markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }

    fn freshness(config: &StreamConfig, channel: Channel) -> Freshness {
        Freshness {
            max_age: config.max_age(channel),
            stall_timeout: config.stall_timeout(channel),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MercadoClient {
    fn venue_id(&self) -> &str {
        &self.id
    }

    fn percentage(&self) -> Decimal {
        self.percentage
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn load_markets(&self) -> ExchangeResult<Markets> {
        let symbols: SymbolsResponse = self.public("/symbols").await?;
        let markets = symbols.into_markets();
        debug!("Loaded {} markets", markets.len());
        if let Ok(mut cached) = self.markets.write() {
            *cached = markets.clone();
        }
        Ok(markets)
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.markets.read().ok()?.get(symbol).cloned()
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<Quote> {
        let market = self.market_for(symbol).await?;
        let tickers: Vec<TickerData> = self
            .public(&format!("/tickers?symbols={}", market.id))
            .await?;
        tickers
            .into_iter()
            .next()
            .map(|t| t.into_quote(symbol))
            .ok_or_else(|| ExchangeError::InvalidSymbol(format!("{}: no ticker data", symbol)))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ExchangeResult<OrderBook> {
        let market = self.market_for(symbol).await?;
        let book: OrderBookData = self
            .public(&format!("/{}/orderbook?limit=200", market.id))
            .await?;
        book.into_order_book(symbol, depth)
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_trades(&self, symbol: &str) -> ExchangeResult<Vec<Trade>> {
        let market = self.market_for(symbol).await?;
        let trades: Vec<TradeData> = self
            .public(&format!("/{}/trades?limit=50", market.id))
            .await?;
        let mut trades: Vec<Trade> = trades.into_iter().map(|t| t.into_trade(symbol)).collect();
        trades.sort_by_key(|t| t.timestamp);
        Ok(trades)
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let market = self.market_for(&request.symbol).await?;
        let body = NewOrder {
            kind: "limit",
            side: request.side,
            qty: request.amount.normalize().to_string(),
            limit_price: request.price.to_f64().unwrap_or_default(),
            is_async: false,
        };
        let raw = self
            .private(
                Method::POST,
                &format!("/{}/orders", market.id),
                Some(&body),
                CallKind::Place,
                None,
            )
            .await?;
        let created: NewOrderResponse = serde_json::from_str(&raw)?;

        debug!(order_id = %created.order_id, side = %request.side, price = %request.price, "Order created");
        Ok(Order {
            id: created.order_id,
            symbol: request.symbol.clone(),
            side: Some(request.side),
            price: Some(request.price),
            status: OrderStatus::Open,
            filled: Decimal::ZERO,
            remaining: request.amount,
        })
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        let market = self.market_for(symbol).await?;
        let raw = self
            .private(
                Method::GET,
                &format!("/{}/orders/{}", market.id, order_id),
                None,
                CallKind::FetchOrder,
                Some(order_id),
            )
            .await?;
        let order: OrderData = serde_json::from_str(&raw)?;
        Ok(order.into_order(symbol))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        let market = self.market_for(symbol).await?;
        let result = self
            .private(
                Method::DELETE,
                &format!("/{}/orders/{}?async=false", market.id, order_id),
                None,
                CallKind::Cancel,
                Some(order_id),
            )
            .await;

        let status = match result {
            Ok(_) => OrderStatus::Canceled,
            // the order is processing or already filled; it is assumed filled
            Err(ExchangeError::Rejected { code, .. }) if code == "INVALID_STATUS" => {
                warn!(order_id, symbol, "Cancel rejected with INVALID_STATUS, assuming filled");
                OrderStatus::Closed
            }
            Err(e) => return Err(e),
        };

        Ok(Order {
            id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: None,
            price: None,
            status,
            filled: Decimal::ZERO,
            remaining: Decimal::ZERO,
        })
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let market = self.market_for(symbol).await?;
        self.private(
            Method::DELETE,
            &format!("/cancel_all_open_orders?symbol={}", market.id),
            None,
            CallKind::Private,
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>> {
        let market = self.market_for(symbol).await?;
        let raw = self
            .private(
                Method::GET,
                &format!("/{}/orders?status=working", market.id),
                None,
                CallKind::Private,
                None,
            )
            .await?;
        let orders: Vec<OrderData> = serde_json::from_str(&raw)?;
        Ok(orders.into_iter().map(|o| o.into_order(symbol)).collect())
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>> {
        let raw = self
            .private(Method::GET, "/balances", None, CallKind::Private, None)
            .await?;
        let balances: Vec<BalanceData> = serde_json::from_str(&raw)?;
        Ok(balances.into_iter().map(Balance::from).collect())
    }

    fn watch_quotes(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Quote> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:quote", self.id, symbol);
        let freshness = Self::freshness(config, Channel::Quote);
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            freshness,
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    websocket::subscribe(&venue.ws_url, WsChannel::Ticker, &market, move |data| {
                        serde_json::from_value::<TickerData>(data)
                            .ok()
                            .map(|t| t.into_quote(&symbol))
                    })
                    .await
                }
            },
            move || {
                let (venue, symbol) = (Arc::clone(&self), symbol.clone());
                async move { venue.fetch_quote(&symbol).await }
            },
        )
    }

    fn watch_order_book(
        self: Arc<Self>,
        symbol: &str,
        depth: usize,
        config: &StreamConfig,
    ) -> MarketStream<OrderBook> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:book", self.id, symbol);
        let freshness = Self::freshness(config, Channel::Book);
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            freshness,
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    websocket::subscribe(&venue.ws_url, WsChannel::OrderBook, &market, move |data| {
                        serde_json::from_value::<OrderBookData>(data)
                            .ok()
                            .and_then(|b| b.into_order_book(&symbol, depth).ok())
                    })
                    .await
                }
            },
            move || {
                let (venue, symbol) = (Arc::clone(&self), symbol.clone());
                async move { venue.fetch_order_book(&symbol, depth).await }
            },
        )
    }

    fn watch_trades(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Trade> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:trades", self.id, symbol);
        let freshness = Self::freshness(config, Channel::Trades);
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            freshness,
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    websocket::subscribe(&venue.ws_url, WsChannel::Trade, &market, move |data| {
                        serde_json::from_value::<TradeData>(data)
                            .ok()
                            .map(|t| t.into_trade(&symbol))
                    })
                    .await
                }
            },
            move || {
                let (venue, symbol) = (Arc::clone(&self), symbol.clone());
                async move {
                    venue
                        .fetch_trades(&symbol)
                        .await?
                        .pop()
                        .ok_or_else(|| ExchangeError::Decode("empty trade tape".into()))
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn venue_config() -> VenueConfig {
        VenueConfig {
            api_key: "login".into(),
            secret: "password".into(),
            kind: crate::config::VenueKind::Mercado,
            ..VenueConfig::mock(dec!(0.003))
        }
    }

    async fn mount_symbols(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/symbols"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": ["BTC-BRL"],
                "base-currency": ["BTC"],
                "currency": ["BRL"],
                "type": ["CRYPTO"],
                "exchange-listed": [true],
                "exchange-traded": [true]
            })))
            .mount(server)
            .await;
    }

    async fn client(server: &MockServer) -> MercadoClient {
        mount_symbols(server).await;
        Mock::given(method("POST"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "token",
                "expiration": Utc::now().timestamp() + 3600
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": "acc1"}])))
            .mount(server)
            .await;

        MercadoClient::with_urls("mercado", &venue_config(), &RetryConfig::default(), &server.uri(), "ws://unused")
            .unwrap()
    }

    #[test]
    fn test_classify_error_codes() {
        let not_found = r#"{"code":"TRADING|GET_ORDER|ORDER_NOT_FOUND"}"#;
        assert!(matches!(
            classify(404, not_found, CallKind::FetchOrder, Some("x")),
            ExchangeError::OrderNotFound { .. }
        ));
        assert!(classify(404, not_found, CallKind::Cancel, Some("x")).is_transient());

        let balance = r#"{"code":"TRADING|PLACE_ORDER|INSUFFICIENT_BALANCE"}"#;
        assert!(matches!(
            classify(400, balance, CallKind::Place, None),
            ExchangeError::InsufficientFunds(_)
        ));

        let min = r#"{"code":"TRADING|PLACE_ORDER|INVALID_MIN_QUANTITY","message":"min {0.00001}"}"#;
        assert!(matches!(
            classify(400, min, CallKind::Place, None),
            ExchangeError::BelowMinimum(_)
        ));

        assert!(classify(403, "", CallKind::Private, None).is_transient());
        assert!(classify(524, "", CallKind::Public, None).is_transient());
        assert!(classify(429, "", CallKind::Public, None).is_transient());
        assert!(classify(400, r#"{"code":"A|B|API_GENERIC_ERROR"}"#, CallKind::Place, None).is_transient());
    }

    #[tokio::test]
    async fn test_fetch_order_not_found() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/accounts/acc1/BTC-BRL/orders/.+$"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": "TRADING|GET_ORDER|ORDER_NOT_FOUND",
                "message": "order not found"
            })))
            .mount(&server)
            .await;

        let err = client
            .fetch_order("01HCDAA7YJ68ZJ0FTEPR7DYDS1", "BTC/BRL")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound { order_id } if order_id == "01HCDAA7YJ68ZJ0FTEPR7DYDS1"));
    }

    #[tokio::test]
    async fn test_cancel_invalid_status_assumes_filled() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/accounts/acc1/BTC-BRL/orders/.+$"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": "TRADING|CANCEL_ORDER|INVALID_STATUS"
            })))
            .mount(&server)
            .await;

        let order = client.cancel_order("abc", "BTC/BRL").await.unwrap();
        assert!(order.is_closed());
    }

    #[tokio::test]
    async fn test_place_order_returns_id() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        Mock::given(method("POST"))
            .and(path("/accounts/acc1/BTC-BRL/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": "01HCDAA7YJ68ZJ0FTEPR7DYDS1"
            })))
            .mount(&server)
            .await;

        let order = client
            .place_order(&OrderRequest {
                symbol: "BTC/BRL".into(),
                side: Side::Sell,
                amount: dec!(0.01),
                price: dec!(300000),
            })
            .await
            .unwrap();
        assert_eq!(order.id, "01HCDAA7YJ68ZJ0FTEPR7DYDS1");
        assert_eq!(order.remaining, dec!(0.01));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_not_retried() {
        let server = MockServer::start().await;
        mount_symbols(&server).await;
        Mock::given(method("POST"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": "AUTH|AUTHORIZE|INVALID_CREDENTIALS",
                "message": "invalid login or password"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let client =
            MercadoClient::with_urls("mercado", &venue_config(), &RetryConfig::default(), &server.uri(), "ws://unused")
                .unwrap();

        let err = client.fetch_order("abc", "BTC/BRL").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { ref code, .. } if code == "INVALID_CREDENTIALS"));
    }
}
