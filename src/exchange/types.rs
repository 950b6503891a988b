//! Venue-agnostic market data and order shapes.
//!
//! Every adapter converts its wire format into these types before handing
//! data to the engine, so pricing and order handling never see venue quirks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that offsets this one.
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// A quote is usable only when both sides are populated.
    pub fn is_usable(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO
    }
}

/// A single `(price, size)` level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Notional volume resting at this level.
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Depth snapshot. Bids are sorted descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        Self {
            symbol: symbol.into(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    /// Levels on which orders of `side` rest.
    pub fn levels(&self, side: Side) -> &[BookLevel] {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Remove our own resting volume from the level at `price`, clamping at zero.
    ///
    /// Returns `true` if a matching level was found.
    pub fn subtract_own(&mut self, side: Side, price: Decimal, size: Decimal) -> bool {
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        match levels.iter_mut().find(|level| level.price == price) {
            Some(level) => {
                level.size = (level.size - size).max(Decimal::ZERO);
                true
            }
            None => false,
        }
    }

    /// Keep at most `depth` levels per side.
    pub fn truncate(&mut self, depth: usize) {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Normalized order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted but not yet processed by the matching engine
    Pending,
    Open,
    Closed,
    Canceled,
}

/// Normalized order as reported by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Option<Side>,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
}

impl Order {
    /// Original order size.
    pub fn amount(&self) -> Decimal {
        self.filled + self.remaining
    }

    pub fn is_closed(&self) -> bool {
        self.status == OrderStatus::Closed
    }
}

/// New limit order request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
}

/// An executed trade on the public tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Market metadata loaded from a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Normalized symbol, e.g. `BTC/BRL`
    pub symbol: String,
    /// Venue-native id, e.g. `BTC-BRL` or `BTCBRL`
    pub id: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
    pub min_amount: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub amount_step: Option<Decimal>,
}

/// Free/used/total balance of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

pub type Markets = HashMap<String, Market>;

/// Split a normalized `BASE/QUOTE` symbol.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    symbol.split_once('/')
}

/// Whether two symbols can be compared without a fiat conversion.
///
/// True if the symbols are equal, share the quote currency, or both are
/// quoted in some USD-pegged currency.
pub fn same_quote_currency(symbol_a: &str, symbol_b: &str) -> bool {
    if symbol_a == symbol_b {
        return true;
    }
    match (split_symbol(symbol_a), split_symbol(symbol_b)) {
        (Some((_, quote_a)), Some((_, quote_b))) => {
            quote_a == quote_b || (quote_a.contains("USD") && quote_b.contains("USD"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook::new(
            "BTC/BRL",
            vec![
                BookLevel::new(dec!(99), dec!(5)),
                BookLevel::new(dec!(98.99), dec!(2.6)),
                BookLevel::new(dec!(97.3), dec!(0.5)),
            ],
            vec![
                BookLevel::new(dec!(100), dec!(1.5)),
                BookLevel::new(dec!(101), dec!(0.7)),
            ],
        )
    }

    #[test]
    fn test_subtract_own_volume() {
        let mut book = book();
        assert!(book.subtract_own(Side::Buy, dec!(98.99), dec!(1.1)));
        assert_eq!(book.bids[1].size, dec!(1.5));

        assert!(book.subtract_own(Side::Sell, dec!(101), dec!(0.2)));
        assert_eq!(book.asks[1].size, dec!(0.5));
    }

    #[test]
    fn test_subtract_own_clamps_at_zero() {
        let mut book = book();
        book.subtract_own(Side::Buy, dec!(97.3), dec!(0.9));
        assert_eq!(book.bids[2].size, Decimal::ZERO);
        assert!(!book.subtract_own(Side::Buy, dec!(50), dec!(1)));
    }

    #[test]
    fn test_same_quote_currency() {
        assert!(same_quote_currency("BTC/BRL", "BTC/BRL"));
        assert!(same_quote_currency("BTC/BRL", "ETH/BRL"));
        assert!(same_quote_currency("BTC/USDT", "BTC/USDC"));
        assert!(!same_quote_currency("BTC/BRL", "BTC/USDT"));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.to_string(), "sell");
    }
}
