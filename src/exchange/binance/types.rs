//! Type definitions for Binance spot API responses.

use crate::exchange::types::*;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Exchange information for spot markets.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

/// Trading pair symbol information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Subset of the symbol filters we care about.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    pub fn into_market(self) -> Market {
        let mut market = Market {
            symbol: format!("{}/{}", self.base_asset, self.quote_asset),
            id: self.symbol,
            base: self.base_asset,
            quote: self.quote_asset,
            active: self.status == "TRADING",
            min_amount: None,
            min_notional: None,
            amount_step: None,
        };
        for filter in self.filters {
            match filter {
                SymbolFilter::LotSize { min_qty, step_size } => {
                    market.min_amount = Some(min_qty);
                    market.amount_step = Some(step_size);
                }
                SymbolFilter::Notional { min_notional } | SymbolFilter::MinNotional { min_notional } => {
                    market.min_notional = Some(min_notional);
                }
                SymbolFilter::Other => {}
            }
        }
        market
    }
}

/// Best bid/ask prices and quantities; shared by REST and the `bookTicker` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct BookTicker {
    #[serde(rename = "b", alias = "bidPrice", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(rename = "a", alias = "askPrice", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
}

impl BookTicker {
    /// Binance does not timestamp book tickers, so they are stamped on receipt.
    pub fn into_quote(self, symbol: &str) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            bid: self.bid_price,
            ask: self.ask_price,
            last: (self.bid_price + self.ask_price) / Decimal::TWO,
            timestamp: Utc::now(),
        }
    }
}

/// Partial depth snapshot from `/api/v3/depth` or `@depth<N>` streams.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Depth {
    pub last_update_id: u64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

impl Depth {
    pub fn into_order_book(self, symbol: &str, depth: usize) -> OrderBook {
        let levels = |raw: Vec<(String, String)>| -> Vec<BookLevel> {
            raw.into_iter()
                .take(depth)
                .filter_map(|(price, size)| Some(BookLevel::new(price.parse().ok()?, size.parse().ok()?)))
                .collect()
        };
        OrderBook::new(symbol, levels(self.bids), levels(self.asks))
    }
}

/// Entry of `/api/v3/trades`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTrade {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub time: i64,
    pub is_buyer_maker: bool,
}

impl RecentTrade {
    pub fn into_trade(self, symbol: &str) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price: self.price,
            amount: self.qty,
            side: taker_side(self.is_buyer_maker),
            timestamp: from_millis(self.time),
        }
    }
}

/// Payload of the `@trade` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl TradeEvent {
    pub fn into_trade(self, symbol: &str) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price: self.price,
            amount: self.qty,
            side: taker_side(self.is_buyer_maker),
            timestamp: from_millis(self.trade_time),
        }
    }
}

/// Order as returned by the signed order endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub status: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
}

impl OrderResponse {
    pub fn into_order(self, symbol: &str) -> Order {
        let side = match self.side.as_deref() {
            Some("BUY") => Some(Side::Buy),
            Some("SELL") => Some(Side::Sell),
            _ => None,
        };
        Order {
            id: self.order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            price: self.price,
            status: order_status(&self.status),
            filled: self.executed_qty,
            remaining: (self.orig_qty - self.executed_qty).max(Decimal::ZERO),
        }
    }
}

/// Map Binance order states onto the normalized lifecycle.
pub fn order_status(raw: &str) -> OrderStatus {
    match raw {
        "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Closed,
        "CANCELED" | "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        _ => OrderStatus::Pending,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<AssetBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

impl From<AssetBalance> for Balance {
    fn from(b: AssetBalance) -> Self {
        Balance {
            asset: b.asset,
            free: b.free,
            used: b.locked,
            total: b.free + b.locked,
        }
    }
}

/// Error payload, `{"code": -2010, "msg": "..."}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

fn taker_side(is_buyer_maker: bool) -> Side {
    if is_buyer_maker {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_filters() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000", "tickSize": "0.01"},
                {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000", "stepSize": "0.00001"},
                {"filterType": "NOTIONAL", "minNotional": "5.00", "applyMinToMarket": true}
            ]
        }"#;
        let market = serde_json::from_str::<SymbolInfo>(json).unwrap().into_market();
        assert_eq!(market.symbol, "BTC/USDT");
        assert_eq!(market.id, "BTCUSDT");
        assert_eq!(market.min_amount, Some(dec!(0.00001)));
        assert_eq!(market.min_notional, Some(dec!(5.00)));
        assert!(market.active);
    }

    #[test]
    fn test_order_response() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "orderId": 28,
            "status": "PARTIALLY_FILLED",
            "side": "SELL",
            "price": "60000.00",
            "origQty": "0.5",
            "executedQty": "0.2"
        }"#;
        let order = serde_json::from_str::<OrderResponse>(json).unwrap().into_order("BTC/USDT");
        assert_eq!(order.id, "28");
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.remaining, dec!(0.3));
        assert_eq!(order.side, Some(Side::Sell));
    }

    #[test]
    fn test_book_ticker_rest_and_stream_shapes() {
        let rest = r#"{"symbol":"BTCUSDT","bidPrice":"100.0","bidQty":"1","askPrice":"101.0","askQty":"2"}"#;
        let stream = r#"{"u":400900217,"s":"BTCUSDT","b":"100.0","B":"1","a":"101.0","A":"2"}"#;
        for json in [rest, stream] {
            let quote = serde_json::from_str::<BookTicker>(json).unwrap().into_quote("BTC/USDT");
            assert_eq!(quote.bid, dec!(100.0));
            assert_eq!(quote.ask, dec!(101.0));
        }
    }
}
