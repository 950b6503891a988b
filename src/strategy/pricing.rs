//! Price band and target price computation.
//!
//! Pure functions only; callers own every piece of state involved.

use crate::exchange::{OrderBook, Side};
use crate::strategy::model::CachedQuote;
use crate::utils::{percentage_diff, round_price};
use rust_decimal::Decimal;

/// Acceptable price band derived from a venue B reference price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBand {
    pub min_price: Decimal,
    pub execution_price: Option<Decimal>,
}

/// Inputs of [`compute_min_price`] that come from the operation.
#[derive(Debug, Clone, Copy)]
pub struct BandParams {
    pub spread: Decimal,
    pub execution_spread: Option<Decimal>,
    pub previous: Option<Decimal>,
    /// Hysteresis in percent
    pub slippage: Decimal,
}

/// Compute the min price for `reference_price`, converted by `rate` unless
/// both legs share a quote currency.
///
/// Returns `None` when the inputs are unusable or the new min price is
/// within `slippage` percent of the previous one.
pub fn compute_min_price(
    reference_price: Decimal,
    rate: Decimal,
    same_quote: bool,
    params: &BandParams,
) -> Option<PriceBand> {
    if reference_price <= Decimal::ZERO || rate <= Decimal::ZERO {
        return None;
    }
    let converted = if same_quote {
        reference_price
    } else {
        reference_price * rate
    };

    let min_price = round_price(converted * params.spread);
    if let Some(previous) = params.previous {
        if percentage_diff(previous, min_price) < params.slippage {
            return None;
        }
    }

    Some(PriceBand {
        min_price,
        execution_price: params.execution_spread.map(|s| round_price(converted * s)),
    })
}

/// Inputs of [`compute_target_price`] that come from the operation.
#[derive(Debug, Clone, Copy)]
pub struct TargetParams {
    pub side: Side,
    pub min_price: Decimal,
    pub max_vol: Decimal,
    pub last_price: Option<Decimal>,
    pub price_tick: Decimal,
    pub allowed_to_go_back: bool,
    pub execution_price: Option<Decimal>,
}

/// Price at which the order should rest, or `None` to leave it where it is.
///
/// `book` must already have our own resting volume removed.
pub fn compute_target_price(book: &OrderBook, params: &TargetParams) -> Option<Decimal> {
    let side = params.side;
    // `a` is at least as aggressive as `b` from the taker's point of view
    let within = |a: Decimal, b: Decimal| match side {
        Side::Buy => a <= b,
        Side::Sell => a >= b,
    };

    let mut target = None;
    if let Some(execution_price) = params.execution_price {
        for level in book.levels(side.opposite()) {
            if !within(level.price, execution_price) {
                break;
            }
            target = Some(level.price);
        }
    }

    if target.is_none() {
        let levels = book.levels(side);
        let start = levels.iter().position(|level| within(level.price, params.min_price))?;

        let mut volume = Decimal::ZERO;
        let mut price = levels[start].price;
        for level in &levels[start..] {
            price = level.price;
            volume += level.notional();
            if volume > params.max_vol {
                break;
            }
            if Some(price) == params.last_price && !params.allowed_to_go_back {
                return None;
            }
        }

        target = Some(round_price(match side {
            Side::Buy => price + params.price_tick,
            Side::Sell => price - params.price_tick,
        }));
    }

    target.filter(|price| Some(*price) != params.last_price)
}

/// Limit price for the hedge of a fill on `filled_side`.
///
/// A filled buy is hedged by selling into the bid, a filled sell by buying
/// at the ask, each worsened by the venue's fee `percentage`.
pub fn hedge_price(quote: &CachedQuote, filled_side: Side, percentage: Decimal) -> Decimal {
    let price = match filled_side {
        Side::Buy => quote.bid * (Decimal::ONE - percentage),
        Side::Sell => quote.ask * (Decimal::ONE + percentage),
    };
    round_price(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BookLevel;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        let level = |p, s| BookLevel::new(p, s);
        OrderBook::new(
            "BTC/BRL",
            vec![
                level(dec!(99), dec!(5)),
                level(dec!(98.99), dec!(1.5)),
                level(dec!(98), dec!(9)),
                level(dec!(97.3), dec!(0)),
            ],
            vec![
                level(dec!(100), dec!(1.5)),
                level(dec!(101), dec!(0.5)),
                level(dec!(101.9), dec!(1.1)),
                level(dec!(102), dec!(3)),
            ],
        )
    }

    fn band(previous: Option<Decimal>) -> BandParams {
        BandParams {
            spread: dec!(1.01),
            execution_spread: None,
            previous,
            slippage: dec!(0.5),
        }
    }

    fn target(side: Side, min_price: Decimal) -> TargetParams {
        TargetParams {
            side,
            min_price,
            max_vol: dec!(200),
            last_price: None,
            price_tick: dec!(0.01),
            allowed_to_go_back: true,
            execution_price: None,
        }
    }

    #[test]
    fn test_min_price_converts_and_rounds() {
        let result = compute_min_price(dec!(100), dec!(5), false, &band(None)).unwrap();
        assert_eq!(result.min_price, dec!(505.00000000));
        assert!(result.execution_price.is_none());

        let same = compute_min_price(dec!(100), dec!(5), true, &band(None)).unwrap();
        assert_eq!(same.min_price, dec!(101));
    }

    #[test]
    fn test_min_price_hysteresis() {
        // 505 -> 507 is a 0.39% move
        let spread = dec!(507) / dec!(500);
        let params = BandParams { spread, ..band(Some(dec!(505))) };
        assert!(compute_min_price(dec!(100), dec!(5), false, &params).is_none());

        // 505 -> 510 is a 0.98% move
        let spread = dec!(510) / dec!(500);
        let params = BandParams { spread, ..band(Some(dec!(505))) };
        let result = compute_min_price(dec!(100), dec!(5), false, &params).unwrap();
        assert_eq!(result.min_price, dec!(510));
    }

    #[test]
    fn test_execution_price_uses_same_conversion() {
        let params = BandParams {
            execution_spread: Some(dec!(1.002)),
            ..band(None)
        };
        let result = compute_min_price(dec!(100), dec!(5), false, &params).unwrap();
        assert_eq!(result.execution_price, Some(dec!(501)));
    }

    #[test]
    fn test_min_price_requires_inputs() {
        assert!(compute_min_price(Decimal::ZERO, dec!(5), false, &band(None)).is_none());
        assert!(compute_min_price(dec!(100), Decimal::ZERO, false, &band(None)).is_none());
    }

    #[test]
    fn test_buy_walks_until_max_volume() {
        // 99*5 = 495 exceeds 200 on the first level
        assert_eq!(compute_target_price(&book(), &target(Side::Buy, dec!(99.5))), Some(dec!(99.01)));

        // skips levels above the min price, then walks 98.99 (148.485) and 98 (882)
        assert_eq!(compute_target_price(&book(), &target(Side::Buy, dec!(98.995))), Some(dec!(98.01)));
    }

    #[test]
    fn test_sell_steps_inside_the_ask() {
        let params = TargetParams {
            max_vol: dec!(100),
            ..target(Side::Sell, dec!(100.5))
        };
        // 101*0.5 = 50.5, then 101.9*1.1 = 112.09 pushes the sum past 100
        assert_eq!(compute_target_price(&book(), &params), Some(dec!(101.89)));
    }

    #[test]
    fn test_no_level_within_min_price() {
        assert_eq!(compute_target_price(&book(), &target(Side::Buy, dec!(90))), None);
    }

    #[test]
    fn test_never_returns_last_price() {
        let params = TargetParams {
            last_price: Some(dec!(99.01)),
            ..target(Side::Buy, dec!(99.5))
        };
        assert_eq!(compute_target_price(&book(), &params), None);

        let params = TargetParams {
            last_price: Some(dec!(100)),
            execution_price: Some(dec!(100)),
            ..target(Side::Buy, dec!(99.5))
        };
        assert_eq!(compute_target_price(&book(), &params), None);
    }

    #[test]
    fn test_go_back_guard() {
        let params = TargetParams {
            max_vol: dec!(1000),
            last_price: Some(dec!(98.99)),
            allowed_to_go_back: false,
            ..target(Side::Buy, dec!(99.5))
        };
        assert_eq!(compute_target_price(&book(), &params), None);

        let params = TargetParams {
            allowed_to_go_back: true,
            ..params
        };
        assert_eq!(compute_target_price(&book(), &params), Some(dec!(98.01)));
    }

    #[test]
    fn test_execution_price_meets_the_opposite_side() {
        let params = TargetParams {
            execution_price: Some(dec!(101)),
            ..target(Side::Buy, dec!(99.5))
        };
        assert_eq!(compute_target_price(&book(), &params), Some(dec!(101)));

        // nothing on the ask side is cheap enough, fall back to the walk
        let params = TargetParams {
            execution_price: Some(dec!(99.9)),
            ..params
        };
        assert_eq!(compute_target_price(&book(), &params), Some(dec!(99.01)));
    }

    #[test]
    fn test_hedge_price() {
        let quote = CachedQuote {
            bid: dec!(20000),
            ask: dec!(20010),
        };
        assert_eq!(hedge_price(&quote, Side::Buy, dec!(0.001)), dec!(19980));
        assert_eq!(hedge_price(&quote, Side::Sell, dec!(0.001)), dec!(20030.01));
    }
}
