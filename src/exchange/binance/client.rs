//! Binance spot REST client.

use super::types::*;
use super::websocket::{connect_and_handle, stream_name, SPOT_TESTNET_WS_URL, SPOT_WS_URL};
use crate::config::{Channel, StreamConfig, VenueConfig};
use crate::exchange::error::ExchangeError;
use crate::exchange::rate_limiter::RateLimiter;
use crate::exchange::stream::{supervised_stream, Freshness, MarketStream};
use crate::exchange::traits::{ExchangeAdapter, ExchangeResult};
use crate::exchange::types::*;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Map a Binance error response onto the shared taxonomy.
fn classify(status: u16, body: &str, order_id: Option<&str>) -> ExchangeError {
    let error: ApiError = serde_json::from_str(body).unwrap_or_default();
    let msg = error.msg;

    match error.code {
        -1003 => return ExchangeError::RateLimited(msg),
        -1001 | -1021 => return ExchangeError::Network(msg),
        -2010 if msg.to_lowercase().contains("insufficient balance") => {
            return ExchangeError::InsufficientFunds(msg)
        }
        -2011 | -2013 => {
            return ExchangeError::OrderNotFound {
                order_id: order_id.unwrap_or_default().to_string(),
            }
        }
        -1013 => return ExchangeError::BelowMinimum(msg),
        -1121 => return ExchangeError::InvalidSymbol(msg),
        -1022 | -2014 | -2015 => return ExchangeError::Auth(msg),
        _ => {}
    }
    if msg.contains("NOTIONAL") || msg.contains("LOT_SIZE") {
        return ExchangeError::BelowMinimum(msg);
    }

    match status {
        418 | 429 | 408 | 500..=599 => ExchangeError::from_status(status, body),
        _ if error.code != 0 => ExchangeError::Rejected {
            code: error.code.to_string(),
            message: msg,
        },
        _ => ExchangeError::from_status(status, body),
    }
}

/// Binance spot adapter.
pub struct BinanceClient {
    id: String,
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    ws_url: String,
    percentage: Decimal,
    limiter: RateLimiter,
    markets: RwLock<Markets>,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(id: &str, config: &VenueConfig) -> ExchangeResult<Self> {
        let (base_url, ws_url) = if config.testnet {
            (SPOT_TESTNET_URL, SPOT_TESTNET_WS_URL)
        } else {
            (SPOT_BASE_URL, SPOT_WS_URL)
        };
        Self::with_urls(id, config, base_url, ws_url)
    }

    pub fn with_urls(
        id: &str,
        config: &VenueConfig,
        base_url: &str,
        ws_url: &str,
    ) -> ExchangeResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            id: id.to_string(),
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            percentage: config.percentage,
            limiter: RateLimiter::new(
                config.rate_limit(),
                Duration::from_millis(config.rate_window_ms),
                Duration::from_secs(1),
            ),
            markets: RwLock::new(Markets::new()),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> ExchangeResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str) -> ExchangeResult<T> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &body, None));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        order_id: Option<&str>,
    ) -> ExchangeResult<T> {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));

        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.limiter.acquire().await;
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &body, order_id));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn market_for(&self, symbol: &str) -> ExchangeResult<Market> {
        if let Some(market) = self.market(symbol) {
            return Ok(market);
        }
        self.load_markets()
            .await?
            .remove(symbol)
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
impl ExchangeAdapter for BinanceClient {
    fn venue_id(&self) -> &str {
        &self.id
    }

    fn percentage(&self) -> Decimal {
        self.percentage
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn load_markets(&self) -> ExchangeResult<Markets> {
        let info: ExchangeInfo = self.get_public("/api/v3/exchangeInfo").await?;
        let markets: Markets = info
            .symbols
            .into_iter()
            .map(|s| {
                let market = s.into_market();
                (market.symbol.clone(), market)
            })
            .collect();
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
        let ticker: BookTicker = self
            .get_public(&format!("/api/v3/ticker/bookTicker?symbol={}", market.id))
            .await?;
        Ok(ticker.into_quote(symbol))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ExchangeResult<OrderBook> {
        let market = self.market_for(symbol).await?;
        let book: Depth = self
            .get_public(&format!("/api/v3/depth?symbol={}&limit={}", market.id, depth.min(5000)))
            .await?;
        Ok(book.into_order_book(symbol, depth))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_trades(&self, symbol: &str) -> ExchangeResult<Vec<Trade>> {
        let market = self.market_for(symbol).await?;
        let trades: Vec<RecentTrade> = self
            .get_public(&format!("/api/v3/trades?symbol={}&limit=50", market.id))
            .await?;
        Ok(trades.into_iter().map(|t| t.into_trade(symbol)).collect())
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let market = self.market_for(&request.symbol).await?;
        let params = [
            ("symbol", market.id.clone()),
            ("side", request.side.as_str().to_uppercase()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", request.amount.normalize().to_string()),
            ("price", request.price.normalize().to_string()),
        ];

        debug!("Placing order: {:?}", request);
        let response: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params, None).await?;
        Ok(response.into_order(&request.symbol))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        let market = self.market_for(symbol).await?;
        let params = [("symbol", market.id), ("orderId", order_id.to_string())];
        let response: OrderResponse = self
            .signed(Method::GET, "/api/v3/order", &params, Some(order_id))
            .await?;
        Ok(response.into_order(symbol))
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<Order> {
        let market = self.market_for(symbol).await?;
        let params = [("symbol", market.id), ("orderId", order_id.to_string())];
        match self
            .signed::<OrderResponse>(Method::DELETE, "/api/v3/order", &params, Some(order_id))
            .await
        {
            Ok(response) => Ok(response.into_order(symbol)),
            // an order that filled before the cancel landed is reported unknown
            Err(ExchangeError::OrderNotFound { .. }) => {
                warn!(order_id, symbol, "Cancel found no open order, checking final state");
                self.fetch_order(order_id, symbol).await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let market = self.market_for(symbol).await?;
        let params = [("symbol", market.id)];
        match self
            .signed::<serde_json::Value>(Method::DELETE, "/api/v3/openOrders", &params, None)
            .await
        {
            Ok(_) | Err(ExchangeError::OrderNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<Order>> {
        let market = self.market_for(symbol).await?;
        let params = [("symbol", market.id)];
        let orders: Vec<OrderResponse> = self
            .signed(Method::GET, "/api/v3/openOrders", &params, None)
            .await?;
        Ok(orders.into_iter().map(|o| o.into_order(symbol)).collect())
    }

    #[instrument(skip(self), fields(venue = %self.id))]
    async fn fetch_balance(&self) -> ExchangeResult<Vec<Balance>> {
        let account: AccountInfo = self.signed(Method::GET, "/api/v3/account", &[], None).await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|b| b.free + b.locked > Decimal::ZERO)
            .map(Balance::from)
            .collect())
    }

    fn watch_quotes(self: Arc<Self>, symbol: &str, config: &StreamConfig) -> MarketStream<Quote> {
        let symbol = symbol.to_string();
        let label = format!("{}:{}:quote", self.id, symbol);
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            Self::freshness(config, Channel::Quote),
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    connect_and_handle(&venue.ws_url, &stream_name(&market.id, "bookTicker"), move |msg| {
                        serde_json::from_str::<BookTicker>(msg).ok().map(|t| t.into_quote(&symbol))
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
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            Self::freshness(config, Channel::Book),
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    connect_and_handle(&venue.ws_url, &stream_name(&market.id, "depth20@100ms"), move |msg| {
                        serde_json::from_str::<Depth>(msg)
                            .ok()
                            .map(|d| d.into_order_book(&symbol, depth))
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
        let (venue, sym) = (Arc::clone(&self), symbol.clone());
        supervised_stream(
            label,
            Self::freshness(config, Channel::Trades),
            move || {
                let (venue, symbol) = (Arc::clone(&venue), sym.clone());
                async move {
                    let market = venue.market_for(&symbol).await?;
                    connect_and_handle(&venue.ws_url, &stream_name(&market.id, "trade"), move |msg| {
                        serde_json::from_str::<TradeEvent>(msg).ok().map(|t| t.into_trade(&symbol))
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
    use crate::config::VenueKind;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> BinanceClient {
        Mock::given(method("GET"))
            .and(path("/api/v3/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbols": [{
                    "symbol": "BTCUSDT",
                    "status": "TRADING",
                    "baseAsset": "BTC",
                    "quoteAsset": "USDT",
                    "filters": [{"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000", "stepSize": "0.00001"}]
                }]
            })))
            .mount(server)
            .await;

        let config = VenueConfig {
            kind: VenueKind::Binance,
            api_key: "key".into(),
            secret: "secret".into(),
            ..VenueConfig::mock(dec!(0.001))
        };
        BinanceClient::with_urls("binance", &config, &server.uri(), "ws://unused").unwrap()
    }

    #[test]
    fn test_classify_error_codes() {
        let insufficient = r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#;
        assert!(matches!(classify(400, insufficient, None), ExchangeError::InsufficientFunds(_)));

        let unknown = r#"{"code":-2013,"msg":"Order does not exist."}"#;
        assert!(matches!(
            classify(400, unknown, Some("42")),
            ExchangeError::OrderNotFound { order_id } if order_id == "42"
        ));

        let notional = r#"{"code":-1013,"msg":"Filter failure: NOTIONAL"}"#;
        assert!(matches!(classify(400, notional, None), ExchangeError::BelowMinimum(_)));

        assert!(classify(429, r#"{"code":-1003,"msg":"Too many requests"}"#, None).is_transient());
        assert!(classify(400, r#"{"code":-1021,"msg":"Timestamp outside recvWindow"}"#, None).is_transient());
        assert!(classify(503, "", None).is_transient());
        assert!(matches!(
            classify(400, r#"{"code":-1100,"msg":"Illegal characters"}"#, None),
            ExchangeError::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_signature_is_hex_sha256() {
        let config = VenueConfig {
            secret: "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j".into(),
            ..VenueConfig::mock(dec!(0))
        };
        let client = BinanceClient::with_urls("binance", &config, "http://localhost", "ws://unused").unwrap();
        let signature = client
            .sign("symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559")
            .unwrap();
        assert_eq!(signature, "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71");
    }

    #[tokio::test]
    async fn test_place_order_sends_api_key() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(header("X-MBX-APIKEY", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "orderId": 7,
                "status": "NEW",
                "side": "BUY",
                "price": "60000",
                "origQty": "0.01",
                "executedQty": "0"
            })))
            .mount(&server)
            .await;

        let order = client
            .place_order(&OrderRequest {
                symbol: "BTC/USDT".into(),
                side: Side::Buy,
                amount: dec!(0.01),
                price: dec!(60000),
            })
            .await
            .unwrap();
        assert_eq!(order.id, "7");
        assert_eq!(order.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_cancel_of_filled_order_returns_final_state() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2011, "msg": "Unknown order sent."
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "orderId": 7,
                "status": "FILLED",
                "side": "BUY",
                "price": "60000",
                "origQty": "0.01",
                "executedQty": "0.01"
            })))
            .mount(&server)
            .await;

        let order = client.cancel_order("7", "BTC/USDT").await.unwrap();
        assert!(order.is_closed());
        assert_eq!(order.filled, dec!(0.01));
    }
}
