//! Automation and operation records.
//!
//! An [`Automation`] is both the persisted record and the live state the
//! runtime mutates. Fields marked `serde(skip)` exist only in memory.

use crate::exchange::{same_quote_currency, split_symbol, OrderBook, Quote, Side};
use crate::utils::non_negative;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Running,
    Paused,
    Finished,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Running => "running",
            OperationStatus::Paused => "paused",
            OperationStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Best bid/ask of the hedge venue, cached for hedge pricing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedQuote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl From<&Quote> for CachedQuote {
    fn from(quote: &Quote) -> Self {
        Self {
            bid: quote.bid,
            ask: quote.ask,
        }
    }
}

/// One priced leg of an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub side: Side,
    /// Share of the automation's base amount for this side
    pub percentage: Decimal,
    /// Multiplier applied to the reference price to get the min price
    pub spread: Decimal,
    /// Tighter multiplier at which the order may cross the book
    #[serde(default)]
    pub execution_spread: Option<Decimal>,
    /// Hysteresis in percent
    #[serde(default)]
    pub slippage: Decimal,
    /// Notional volume walked past before resting
    pub max_vol: Decimal,
    pub price_tick: Decimal,
    /// Whether a fill is hedged on venue B
    #[serde(default)]
    pub trade: bool,
    /// Fixed price band; disables min price recomputation
    #[serde(default)]
    pub fixed_min_price: Option<Decimal>,

    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub remaining: Decimal,
    /// Hedge volume rejected as below the venue minimum
    #[serde(default)]
    pub waiting_amount: Decimal,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub min_price: Option<Decimal>,
    #[serde(default)]
    pub execution_price: Option<Decimal>,
    /// Venue B reference price the min price was derived from
    #[serde(default)]
    pub exchange_price: Option<Decimal>,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(skip)]
    pub must_check: bool,
    #[serde(skip)]
    pub allowed_to_go_back: bool,
}

impl Operation {
    /// Whether the book pass should consider this operation at all.
    pub fn is_active(&self) -> bool {
        self.status == OperationStatus::Running
            && self.min_price.is_some()
            && self.remaining > Decimal::ZERO
            && self.amount > Decimal::ZERO
    }

    /// Record a status change with a timestamped reason.
    pub fn set_status(&mut self, status: OperationStatus, reason: &str) {
        self.status = status;
        self.reason = Some(format!("{} {}", Utc::now().format("%H:%M:%S"), reason));
    }

    /// Grow this leg by `volume` and make it re-check its order.
    fn absorb(&mut self, volume: Decimal) {
        self.amount += volume;
        self.remaining += volume;
        self.status = OperationStatus::Running;
        self.must_check = true;
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Missing(&'static str),

    #[error("invalid symbol {0}, expected BASE/QUOTE")]
    InvalidSymbol(String),

    #[error("automation has no operations")]
    NoOperations,

    #[error("duplicate operation id {0}")]
    DuplicateOperation(String),

    #[error("operation {id}: {field} must be positive")]
    NotPositive { id: String, field: &'static str },

    #[error("{field} must not be negative")]
    Negative { field: String },

    #[error("operation {id}: remaining {remaining} exceeds amount {amount}")]
    RemainingExceedsAmount {
        id: String,
        remaining: Decimal,
        amount: Decimal,
    },

    #[error("{side} operations share {total} of the base amount, more than 1")]
    ShareOverflow { side: Side, total: Decimal },
}

/// A cross-venue strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    /// Venue where orders rest
    pub venue_a: String,
    pub symbol_a: String,
    /// Venue where fills are hedged
    pub venue_b: String,
    pub symbol_b: String,
    pub buy_amount: Decimal,
    pub sell_amount: Decimal,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub ticker: Option<CachedQuote>,
    #[serde(skip)]
    pub order_count: usize,
}

impl Automation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("id", &self.id),
            ("venue_a", &self.venue_a),
            ("venue_b", &self.venue_b),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Missing(field));
            }
        }
        for symbol in [&self.symbol_a, &self.symbol_b] {
            match split_symbol(symbol) {
                Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {}
                _ => return Err(ValidationError::InvalidSymbol(symbol.clone())),
            }
        }
        for (field, value) in [("buy_amount", self.buy_amount), ("sell_amount", self.sell_amount)] {
            if value < Decimal::ZERO {
                return Err(ValidationError::Negative { field: field.into() });
            }
        }
        if self.operations.is_empty() {
            return Err(ValidationError::NoOperations);
        }

        let mut ids = HashSet::new();
        for op in &self.operations {
            if !ids.insert(op.id.as_str()) {
                return Err(ValidationError::DuplicateOperation(op.id.clone()));
            }
            for (field, value) in [
                ("percentage", op.percentage),
                ("spread", op.spread),
                ("price_tick", op.price_tick),
            ] {
                if value <= Decimal::ZERO {
                    return Err(ValidationError::NotPositive {
                        id: op.id.clone(),
                        field,
                    });
                }
            }
            for (field, value) in [
                ("max_vol", op.max_vol),
                ("slippage", op.slippage),
                ("amount", op.amount),
                ("remaining", op.remaining),
                ("waiting_amount", op.waiting_amount),
            ] {
                if value < Decimal::ZERO {
                    return Err(ValidationError::Negative {
                        field: format!("operation {}: {}", op.id, field),
                    });
                }
            }
            if op.remaining > op.amount {
                return Err(ValidationError::RemainingExceedsAmount {
                    id: op.id.clone(),
                    remaining: op.remaining,
                    amount: op.amount,
                });
            }
        }

        for side in [Side::Buy, Side::Sell] {
            let total: Decimal = self
                .operations
                .iter()
                .filter(|op| op.side == side)
                .map(|op| op.percentage)
                .sum();
            if total > Decimal::ONE {
                return Err(ValidationError::ShareOverflow { side, total });
            }
        }
        Ok(())
    }

    /// Reset operations for a fresh start.
    ///
    /// Returns `true` if any operation still referenced a venue order from a
    /// previous run.
    pub fn normalize_for_start(&mut self) -> bool {
        let had_orders = self.operations.iter().any(|op| op.order_id.is_some());

        // the book pass relies on sells coming first
        self.operations.sort_by_key(|op| match op.side {
            Side::Sell => 0,
            Side::Buy => 1,
        });

        let (buy_amount, sell_amount) = (self.buy_amount, self.sell_amount);
        for op in &mut self.operations {
            op.amount = if op.remaining > Decimal::ZERO {
                op.remaining
            } else {
                op.percentage
                    * match op.side {
                        Side::Buy => buy_amount,
                        Side::Sell => sell_amount,
                    }
            };
            op.remaining = op.amount;
            op.order_id = None;
            op.last_price = None;
            op.must_check = false;
            op.allowed_to_go_back = true;
            op.min_price = op.fixed_min_price;
            op.execution_price = None;
        }

        self.ticker = None;
        self.order_count = self.operations.len();
        had_orders
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn operation_mut(&mut self, id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    /// Whether min prices can be taken from venue B without conversion.
    pub fn same_quote_currency(&self) -> bool {
        same_quote_currency(&self.symbol_a, &self.symbol_b)
    }

    /// Spread a fill on `filled_side` across the opposite-side operations.
    ///
    /// Returns the ids of the operations that grew.
    pub fn rebalance(&mut self, filled_side: Side, filled: Decimal) -> Vec<String> {
        self.operations
            .iter_mut()
            .filter(|op| op.side == filled_side.opposite())
            .map(|op| {
                op.absorb(op.percentage * filled);
                op.id.clone()
            })
            .collect()
    }

    /// Remove our own resting volume from `book`.
    pub fn subtract_own_volume(&self, book: &mut OrderBook) {
        for op in &self.operations {
            if let (Some(price), Some(_)) = (op.last_price, &op.order_id) {
                book.subtract_own(op.side, price, op.remaining);
            }
        }
    }

    /// Flag operations whose resting price a trade at `price` crossed.
    pub fn mark_crossed(&mut self, price: Decimal) -> Vec<String> {
        let mut crossed = Vec::new();
        for op in &mut self.operations {
            let Some(last) = op.last_price else { continue };
            if op.amount.is_zero() {
                continue;
            }
            let hit = match op.side {
                Side::Buy => price <= last,
                Side::Sell => price >= last,
            };
            if hit {
                op.must_check = true;
                crossed.push(op.id.clone());
            }
        }
        crossed
    }

    /// Reduce remaining volume after a fill, never below zero.
    pub fn consume(&mut self, op_id: &str, filled: Decimal) -> Option<Decimal> {
        let op = self.operation_mut(op_id)?;
        op.remaining = non_negative(op.remaining - filled);
        Some(op.remaining)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn operation(id: &str, side: Side, percentage: Decimal) -> Operation {
        Operation {
            id: id.to_string(),
            side,
            percentage,
            spread: match side {
                Side::Buy => dec!(0.99),
                Side::Sell => dec!(1.01),
            },
            execution_spread: None,
            slippage: dec!(0.5),
            max_vol: dec!(1000),
            price_tick: dec!(0.01),
            trade: true,
            fixed_min_price: None,
            amount: Decimal::ZERO,
            remaining: Decimal::ZERO,
            waiting_amount: Decimal::ZERO,
            order_id: None,
            last_price: None,
            min_price: None,
            execution_price: None,
            exchange_price: None,
            status: OperationStatus::Running,
            reason: None,
            must_check: false,
            allowed_to_go_back: true,
        }
    }

    pub fn automation(operations: Vec<Operation>) -> Automation {
        Automation {
            id: "auto-1".into(),
            venue_a: "mercado".into(),
            symbol_a: "BTC/BRL".into(),
            venue_b: "binance".into(),
            symbol_b: "BTC/USDT".into(),
            buy_amount: dec!(100),
            sell_amount: dec!(100),
            operations,
            created_at: None,
            updated_at: None,
            ticker: None,
            order_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rebalance_splits_fill_by_share() {
        let mut automation = automation(vec![
            operation("buy", Side::Buy, dec!(1)),
            operation("sell-a", Side::Sell, dec!(0.6)),
            operation("sell-b", Side::Sell, dec!(0.4)),
        ]);
        automation.operations[1].status = OperationStatus::Finished;

        let grown = automation.rebalance(Side::Buy, dec!(100));
        assert_eq!(grown, vec!["sell-a".to_string(), "sell-b".to_string()]);

        let a = automation.operation("sell-a").unwrap();
        assert_eq!((a.amount, a.remaining), (dec!(60), dec!(60)));
        let b = automation.operation("sell-b").unwrap();
        assert_eq!((b.amount, b.remaining), (dec!(40), dec!(40)));
        for op in [a, b] {
            assert_eq!(op.status, OperationStatus::Running);
            assert!(op.must_check);
        }
        assert!(!automation.operation("buy").unwrap().must_check);
    }

    #[test]
    fn test_normalize_for_start() {
        let mut buy = operation("buy", Side::Buy, dec!(0.5));
        buy.order_id = Some("old".into());
        buy.last_price = Some(dec!(100));
        let mut sell = operation("sell", Side::Sell, dec!(1));
        sell.amount = dec!(80);
        sell.remaining = dec!(30);
        sell.fixed_min_price = Some(dec!(120));
        let mut automation = automation(vec![buy, sell]);
        automation.buy_amount = dec!(200);

        assert!(automation.normalize_for_start());
        assert_eq!(automation.operations[0].id, "sell");

        let sell = &automation.operations[0];
        assert_eq!((sell.amount, sell.remaining), (dec!(30), dec!(30)));
        assert_eq!(sell.min_price, Some(dec!(120)));

        let buy = &automation.operations[1];
        assert_eq!((buy.amount, buy.remaining), (dec!(100), dec!(100)));
        assert!(buy.order_id.is_none() && buy.last_price.is_none());
        assert!(buy.allowed_to_go_back);
        assert_eq!(automation.order_count, 2);
    }

    #[test]
    fn test_share_overflow_rejected() {
        let automation = automation(vec![
            operation("sell-a", Side::Sell, dec!(0.7)),
            operation("sell-b", Side::Sell, dec!(0.4)),
        ]);
        assert_eq!(
            automation.validate(),
            Err(ValidationError::ShareOverflow {
                side: Side::Sell,
                total: dec!(1.1)
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let mut bad_symbol = automation(vec![operation("buy", Side::Buy, dec!(1))]);
        bad_symbol.symbol_b = "BTCUSDT".into();
        assert!(matches!(bad_symbol.validate(), Err(ValidationError::InvalidSymbol(_))));

        let mut dup = automation(vec![
            operation("x", Side::Buy, dec!(0.5)),
            operation("x", Side::Sell, dec!(0.5)),
        ]);
        assert!(matches!(dup.validate(), Err(ValidationError::DuplicateOperation(_))));

        dup.operations[1].id = "y".into();
        dup.operations[1].price_tick = Decimal::ZERO;
        assert!(matches!(dup.validate(), Err(ValidationError::NotPositive { field: "price_tick", .. })));
    }

    #[test]
    fn test_mark_crossed() {
        let mut buy = operation("buy", Side::Buy, dec!(1));
        buy.amount = dec!(1);
        buy.last_price = Some(dec!(100));
        let mut sell = operation("sell", Side::Sell, dec!(1));
        sell.amount = dec!(1);
        sell.last_price = Some(dec!(110));
        let mut idle = operation("idle", Side::Sell, dec!(0.5));
        idle.last_price = Some(dec!(90));
        let mut automation = automation(vec![buy, sell, idle]);

        assert_eq!(automation.mark_crossed(dec!(100)), vec!["buy".to_string()]);
        assert_eq!(automation.mark_crossed(dec!(110.5)), vec!["sell".to_string()]);
        assert!(!automation.operation("idle").unwrap().must_check);
    }

    #[test]
    fn test_subtract_own_volume() {
        let mut buy = operation("buy", Side::Buy, dec!(1));
        buy.order_id = Some("o1".into());
        buy.last_price = Some(dec!(98.99));
        buy.remaining = dec!(1.1);
        let automation = automation(vec![buy]);

        let mut book = OrderBook::new(
            "BTC/BRL",
            vec![
                crate::exchange::BookLevel::new(dec!(99), dec!(5)),
                crate::exchange::BookLevel::new(dec!(98.99), dec!(2.6)),
            ],
            vec![],
        );
        automation.subtract_own_volume(&mut book);
        assert_eq!(book.bids[1].size, dec!(1.5));
    }

    #[test]
    fn test_record_round_trip_skips_runtime_fields() {
        let mut automation = automation(vec![operation("buy", Side::Buy, dec!(1))]);
        automation.operations[0].must_check = true;
        automation.ticker = Some(CachedQuote { bid: dec!(1), ask: dec!(2) });

        let json = serde_json::to_string(&automation).unwrap();
        let restored: Automation = serde_json::from_str(&json).unwrap();
        assert!(restored.ticker.is_none());
        assert!(!restored.operations[0].must_check);
        assert_eq!(restored.operations[0].spread, automation.operations[0].spread);
    }
}
