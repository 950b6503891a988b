//! Type definitions for Mercado Bitcoin v4 API payloads.

use crate::exchange::error::ExchangeError;
use crate::exchange::types::*;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Columnar response of `/symbols`.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolsResponse {
    pub symbol: Vec<String>,
    #[serde(rename = "base-currency")]
    pub base_currency: Vec<String>,
    pub currency: Vec<String>,
    #[serde(rename = "type")]
    pub kind: Vec<String>,
    #[serde(rename = "exchange-listed")]
    pub exchange_listed: Vec<bool>,
    #[serde(rename = "exchange-traded")]
    pub exchange_traded: Vec<bool>,
}

impl SymbolsResponse {
    /// Tradable spot markets keyed by normalized symbol.
    pub fn into_markets(self) -> Markets {
        let mut markets = Markets::new();
        for (i, id) in self.symbol.iter().enumerate() {
            let kind = self.kind.get(i).map(String::as_str).unwrap_or_default();
            // tokenized assets are not order-book markets
            if kind == "DIGITAL_ASSET" || kind == "DIGITAL_VARIABLE_INCOME" {
                continue;
            }
            let (Some(base), Some(quote)) = (self.base_currency.get(i), self.currency.get(i)) else {
                continue;
            };
            let symbol = id.replace('-', "/");
            markets.insert(
                symbol.clone(),
                Market {
                    symbol,
                    id: id.clone(),
                    base: base.clone(),
                    quote: quote.clone(),
                    active: self.exchange_listed.get(i).copied().unwrap_or(false)
                        && self.exchange_traded.get(i).copied().unwrap_or(false),
                    min_amount: None,
                    min_notional: None,
                    amount_step: None,
                },
            );
        }
        markets
    }
}

/// Entry of `/tickers` and payload of the `ticker` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerData {
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub buy: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub sell: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub last: Decimal,
    /// Seconds since epoch
    pub date: i64,
}

impl TickerData {
    pub fn into_quote(self, symbol: &str) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            bid: self.buy,
            ask: self.sell,
            last: self.last,
            timestamp: from_secs(self.date),
        }
    }
}

/// Response of `/{id}/orderbook` and payload of the `orderbook` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookData {
    pub asks: Vec<(Value, Value)>,
    pub bids: Vec<(Value, Value)>,
    /// Nanoseconds since epoch
    pub timestamp: i64,
}

impl OrderBookData {
    pub fn into_order_book(self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        let levels = |raw: Vec<(Value, Value)>| -> Result<Vec<BookLevel>, ExchangeError> {
            raw.into_iter()
                .take(depth)
                .map(|(price, size)| Ok(BookLevel::new(decimal_value(&price)?, decimal_value(&size)?)))
                .collect()
        };
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: levels(self.bids)?,
            asks: levels(self.asks)?,
            timestamp: Utc.timestamp_nanos(self.timestamp),
        })
    }
}

/// Entry of `/{id}/trades` and payload of the `trade` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeData {
    pub date: i64,
    #[serde(rename = "type")]
    pub side: Side,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub amount: Decimal,
}

impl TradeData {
    pub fn into_trade(self, symbol: &str) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price: self.price,
            amount: self.amount,
            side: self.side,
            timestamp: from_secs(self.date),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest<'a> {
    pub login: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    pub access_token: String,
    /// Token expiry, seconds since epoch
    pub expiration: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub side: Side,
    pub qty: String,
    /// Sent as a JSON number
    pub limit_price: f64,
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub order_id: String,
}

/// Order as returned by the private order endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub id: String,
    #[serde(default)]
    pub instrument: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_decimal_flex_opt")]
    pub qty: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_decimal_flex_opt")]
    pub filled_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_decimal_flex_opt")]
    pub limit_price: Option<Decimal>,
}

impl OrderData {
    pub fn into_order(self, symbol: &str) -> Order {
        let filled = self.filled_qty.unwrap_or_default();
        let remaining = self
            .qty
            .map(|qty| (qty - filled).max(Decimal::ZERO))
            .unwrap_or_default();
        Order {
            id: self.id,
            symbol: symbol.to_string(),
            side: self.side,
            price: self.limit_price,
            status: order_status(&self.status),
            filled,
            remaining,
        }
    }
}

/// Map venue order states onto the normalized lifecycle.
pub fn order_status(raw: &str) -> OrderStatus {
    match raw {
        "working" => OrderStatus::Open,
        "filled" => OrderStatus::Closed,
        "cancelled" => OrderStatus::Canceled,
        _ => OrderStatus::Pending,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceData {
    pub symbol: String,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub available: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub on_hold: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_flex")]
    pub total: Decimal,
}

impl From<BalanceData> for Balance {
    fn from(b: BalanceData) -> Self {
        Balance {
            asset: b.symbol,
            free: b.available,
            used: b.on_hold,
            total: b.total,
        }
    }
}

/// Error payload; `code` looks like `DOMAIN|SCOPE|ORDER_NOT_FOUND`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    /// Short error code, the third `|`-separated segment when present.
    pub fn short_code(&self) -> String {
        match &self.code {
            Some(code) => code.split('|').nth(2).unwrap_or(code).to_string(),
            None => String::new(),
        }
    }
}

/// Push channel message envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscribe {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub name: &'static str,
    /// Quote then base, e.g. `BRLBTC`
    pub id: String,
    pub limit: u32,
}

fn from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn decimal_value(value: &Value) -> Result<Decimal, ExchangeError> {
    match value {
        Value::String(s) => s
            .parse::<Decimal>()
            .map_err(|e| ExchangeError::Decode(format!("{}: {}", s, e))),
        Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|e| ExchangeError::Decode(format!("{}: {}", n, e))),
        other => Err(ExchangeError::Decode(format!("expected number, got {}", other))),
    }
}

/// Accepts both `"123.45"` and `123.45`.
fn deserialize_decimal_flex<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decimal_value(&value).map_err(serde::de::Error::custom)
}

fn deserialize_decimal_flex_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(value) => decimal_value(&value).map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbols_skip_tokenized_assets() {
        let json = r#"{
            "symbol": ["BTC-BRL", "MBCCSH01-BRL"],
            "base-currency": ["BTC", "MBCCSH01"],
            "currency": ["BRL", "BRL"],
            "type": ["CRYPTO", "DIGITAL_ASSET"],
            "exchange-listed": [true, true],
            "exchange-traded": [true, true]
        }"#;
        let markets = serde_json::from_str::<SymbolsResponse>(json).unwrap().into_markets();
        assert_eq!(markets.len(), 1);
        let btc = &markets["BTC/BRL"];
        assert_eq!(btc.id, "BTC-BRL");
        assert!(btc.active);
    }

    #[test]
    fn test_order_book_accepts_strings_and_numbers() {
        let json = r#"{
            "asks": [["300100.5", "0.01"], [300200, 0.5]],
            "bids": [["300000", "0.2"]],
            "timestamp": 1700000000000000000
        }"#;
        let book = serde_json::from_str::<OrderBookData>(json)
            .unwrap()
            .into_order_book("BTC/BRL", 50)
            .unwrap();
        assert_eq!(book.asks[1].price, dec!(300200));
        assert_eq!(book.bids[0].size, dec!(0.2));
    }

    #[test]
    fn test_order_remaining_and_status() {
        let json = r#"{
            "id": "01HCDAA7YJ68ZJ0FTEPR7DYDS1",
            "instrument": "BTC-BRL",
            "side": "buy",
            "status": "working",
            "qty": "0.5",
            "filledQty": "0.2",
            "limitPrice": 300000
        }"#;
        let order = serde_json::from_str::<OrderData>(json).unwrap().into_order("BTC/BRL");
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.filled, dec!(0.2));
        assert_eq!(order.remaining, dec!(0.3));
        assert_eq!(order_status("created"), OrderStatus::Pending);
    }

    #[test]
    fn test_error_short_code() {
        let body = ErrorBody::parse(r#"{"code":"TRADING|GET_ORDER|ORDER_NOT_FOUND","message":"x"}"#);
        assert_eq!(body.short_code(), "ORDER_NOT_FOUND");
        assert_eq!(ErrorBody::parse("not json").short_code(), "");
    }
}
