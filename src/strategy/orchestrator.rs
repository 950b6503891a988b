//! Order lifecycle of one operation.
//!
//! A tick fetches the resting order, cancels it, accounts for any fill
//! (hedge on venue B, rebalance of opposite legs) and places a fresh order at
//! the operation's current `last_price`. Venue calls run strictly one after
//! another; the automation state lock is only taken between them.

use crate::exchange::{
    with_retry, CallSite, ExchangeError, ExchangeResult, Order, OrderRequest, OrderStatus,
    RetryPolicy, Side,
};
use crate::notify::{AlertLevel, FieldUpdate};
use crate::strategy::model::OperationStatus;
use crate::strategy::pricing::hedge_price;
use crate::strategy::runtime::AutomationRuntime;
use crate::utils::round_down_to_lot;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// What one orchestrator tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do
    Skipped,
    /// First order placed
    Placed,
    /// Venue lost the order; placed again with the same parameters
    Recreated,
    /// Order replaced at the current target price
    Repositioned,
    /// Fully executed
    Finished,
    Paused,
}

/// Fields of the operation a tick works with.
struct Leg {
    side: Side,
    trade: bool,
    order_id: Option<String>,
}

impl AutomationRuntime {
    /// Advance one operation's order by one tick.
    pub async fn operate(&self, op_id: &str) -> TickOutcome {
        self.watchdogs.rearm(op_id);
        let leg = {
            let mut state = self.state.lock().await;
            let Some(op) = state.operation_mut(op_id) else {
                return TickOutcome::Skipped;
            };
            op.must_check = false;
            op.allowed_to_go_back = false;
            Leg {
                side: op.side,
                trade: op.trade,
                order_id: op.order_id.clone(),
            }
        };
        if !self.is_live() {
            return TickOutcome::Skipped;
        }

        let Some(order_id) = leg.order_id.clone() else {
            return match self.place(op_id).await {
                Ok(None) => TickOutcome::Skipped,
                Ok(Some(_)) => {
                    self.publish_snapshot().await;
                    self.persist().await;
                    TickOutcome::Placed
                }
                Err(e) => {
                    self.report(AlertLevel::Error, "place_order", leg.side, &e).await;
                    self.pause(op_id, OperationStatus::Paused, "could not place first order").await
                }
            };
        };

        let mut order = match self.fetch_order(&order_id).await {
            Ok(order) => order,
            Err(ExchangeError::OrderNotFound { .. }) => return self.recreate(op_id, leg.side).await,
            Err(e) => {
                self.report(AlertLevel::Error, "fetch_order", leg.side, &e).await;
                return self.pause(op_id, OperationStatus::Paused, "could not fetch order").await;
            }
        };

        if order.status == OrderStatus::Canceled {
            warn!(automation = %self.id(), operation = %op_id, order_id = %order_id, "Order canceled outside the engine");
            {
                let mut state = self.state.lock().await;
                if let Some(op) = state.operation_mut(op_id) {
                    op.remaining = Decimal::ZERO;
                    op.amount = Decimal::ZERO;
                }
            }
            return self.pause(op_id, OperationStatus::Paused, "canceled externally").await;
        }

        if !order.is_closed() {
            match self.cancel_order(&order_id).await {
                Err(e) => {
                    self.report(AlertLevel::Error, "cancel_order", leg.side, &e).await;
                    return self.pause(op_id, OperationStatus::Paused, "could not cancel order").await;
                }
                Ok(canceled) if canceled.is_closed() => {
                    // venues refuse to cancel filled orders; the whole order is taken as filled
                    warn!(automation = %self.id(), operation = %op_id, order_id = %order_id, "Cancel reported the order closed, assuming fully filled");
                    order.filled = order.amount();
                    order.remaining = Decimal::ZERO;
                    order.status = OrderStatus::Closed;
                }
                Ok(_) => match self.fetch_order(&order_id).await {
                    Ok(latest) => order = latest,
                    Err(ExchangeError::OrderNotFound { .. }) => return self.recreate(op_id, leg.side).await,
                    Err(e) => {
                        self.report(AlertLevel::Error, "fetch_order", leg.side, &e).await;
                        return self
                            .pause(op_id, OperationStatus::Paused, "could not re-check order after cancel")
                            .await;
                    }
                },
            }
        }

        if order.filled > Decimal::ZERO {
            if let Some(outcome) = self.account_fill(op_id, &leg, &order).await {
                return outcome;
            }
        }

        match self.place(op_id).await {
            Ok(Some(_)) => TickOutcome::Repositioned,
            Ok(None) => TickOutcome::Skipped,
            Err(e) => {
                self.report(AlertLevel::Error, "place_order", leg.side, &e).await;
                self.pause(op_id, OperationStatus::Paused, "could not reposition order").await
            }
        }
    }

    /// Hedge, rebalance and book a fill. Returns the final outcome if the
    /// order was fully executed.
    async fn account_fill(&self, op_id: &str, leg: &Leg, order: &Order) -> Option<TickOutcome> {
        let filled = order.filled;
        info!(automation = %self.id(), operation = %op_id, side = %leg.side, filled = %filled, closed = order.is_closed(), "Order filled");

        if leg.trade {
            let waiting = {
                let state = self.state.lock().await;
                state.operation(op_id).map(|op| op.waiting_amount).unwrap_or_default()
            };
            self.hedge(op_id, leg.side, filled + waiting).await;

            let grown = {
                let mut state = self.state.lock().await;
                let ids = state.rebalance(leg.side, filled);
                ids.into_iter()
                    .filter_map(|id| state.operation(&id).map(|op| (id, op.amount, op.remaining)))
                    .collect::<Vec<_>>()
            };
            for (id, amount, remaining) in grown {
                self.publish_fields(
                    &id,
                    vec![
                        FieldUpdate::new("amount", amount),
                        FieldUpdate::new("remaining", remaining),
                        FieldUpdate::new("status", OperationStatus::Running),
                    ],
                );
            }
        }

        let remaining = {
            let mut state = self.state.lock().await;
            let remaining = state.consume(op_id, filled).unwrap_or_default();
            if order.is_closed() {
                if let Some(op) = state.operation_mut(op_id) {
                    // a cleared id keeps the opposite leg's next fill from re-detecting this one
                    op.order_id = None;
                    op.amount = Decimal::ZERO;
                    // below one lot, so never placeable
                    op.remaining = Decimal::ZERO;
                }
            }
            remaining
        };

        if order.is_closed() {
            return Some(self.pause(op_id, OperationStatus::Finished, "fully executed").await);
        }

        self.persist().await;
        self.publish_fields(op_id, vec![FieldUpdate::new("remaining", remaining)]);
        None
    }

    /// Place the opposite order on venue B for `amount`.
    ///
    /// Transient failures retry until the order lands. Whatever does not
    /// fit the venue's lot size or minimum is kept in `waiting_amount` for
    /// the next fill.
    async fn hedge(&self, op_id: &str, filled_side: Side, amount: Decimal) {
        let symbol = self.state.lock().await.symbol_b.clone();
        let venue = self.venue_b.as_ref();
        let hedge_side = filled_side.opposite();
        let percentage = venue.percentage();
        let step = venue.market(&symbol).and_then(|m| m.amount_step);
        let size = step.map_or(amount, |step| round_down_to_lot(amount, step));
        if size <= Decimal::ZERO {
            let mut state = self.state.lock().await;
            if let Some(op) = state.operation_mut(op_id) {
                op.waiting_amount = amount;
            }
            info!(automation = %self.id(), venue = venue.venue_id(), side = %hedge_side, amount = %amount, "Hedge below one lot, carrying forward");
            return;
        }
        let policy = RetryPolicy::unbounded(&self.ctx.config.retry);
        let site = CallSite::new("place_order", venue.venue_id(), &symbol).with_side(hedge_side);

        let runtime = self;
        let pair = symbol.as_str();
        let result = with_retry(&policy, site, move || async move {
            // re-priced from the latest quote on every attempt
            let quote = runtime.state.lock().await.ticker;
            let Some(quote) = quote else {
                return Err(ExchangeError::Network("no venue B quote cached".into()));
            };
            let request = OrderRequest {
                symbol: pair.to_string(),
                side: hedge_side,
                amount: size,
                price: hedge_price(&quote, filled_side, percentage),
            };
            venue.place_order(&request).await
        })
        .await;

        let mut state = self.state.lock().await;
        let Some(op) = state.operation_mut(op_id) else {
            return;
        };
        match result {
            Ok(order) => {
                op.waiting_amount = amount - size;
                info!(automation = %self.id(), venue = venue.venue_id(), side = %hedge_side, amount = %size, carried = %op.waiting_amount, order_id = %order.id, "Hedge placed");
            }
            Err(ExchangeError::BelowMinimum(reason)) => {
                op.waiting_amount = amount;
                info!(automation = %self.id(), venue = venue.venue_id(), side = %hedge_side, amount = %amount, reason = %reason, "Hedge below venue minimum, carrying forward");
            }
            Err(e) => {
                drop(state);
                let message = format!("{} [{}]: {}", site, e.label(), e);
                self.ctx.notifier.alert(AlertLevel::Warning, message);
            }
        }
    }

    /// Place the operation's `remaining` at its `last_price` on venue A.
    ///
    /// Returns `Ok(None)` without calling the venue when there is nothing
    /// to place.
    async fn place(&self, op_id: &str) -> ExchangeResult<Option<Order>> {
        let (symbol, side, remaining, price) = {
            let mut state = self.state.lock().await;
            let symbol = state.symbol_a.clone();
            let Some(op) = state.operation_mut(op_id) else {
                return Ok(None);
            };
            op.order_id = None;
            (symbol, op.side, op.remaining, op.last_price)
        };
        let Some(price) = price else {
            return Ok(None);
        };
        if remaining <= Decimal::ZERO {
            return Ok(None);
        }

        let venue = self.venue_a.as_ref();
        let step = venue.market(&symbol).and_then(|m| m.amount_step);
        let amount = step.map_or(remaining, |step| round_down_to_lot(remaining, step));
        if amount <= Decimal::ZERO {
            debug!(automation = %self.id(), operation = %op_id, remaining = %remaining, "Remaining below one lot, nothing to place");
            return Ok(None);
        }
        let request = OrderRequest {
            symbol: symbol.clone(),
            side,
            amount,
            price,
        };
        let policy = RetryPolicy::placement(
            &self.ctx.config.retry,
            self.ctx.config.max_place_attempts(venue.venue_id()),
        );
        let site = CallSite::new("place_order", venue.venue_id(), &symbol).with_side(side);
        let req = &request;
        let order = with_retry(&policy, site, move || venue.place_order(req)).await?;

        debug!(automation = %self.id(), operation = %op_id, side = %side, price = %price, amount = %request.amount, order_id = %order.id, "Order placed");
        let mut state = self.state.lock().await;
        if let Some(op) = state.operation_mut(op_id) {
            op.order_id = Some(order.id.clone());
        }
        Ok(Some(order))
    }

    /// Place the order again after the venue lost it.
    async fn recreate(&self, op_id: &str, side: Side) -> TickOutcome {
        let symbol = self.state.lock().await.symbol_a.clone();
        self.ctx.notifier.alert(
            AlertLevel::Warning,
            format!("({} | {}) order not found, recreating", symbol, side),
        );
        match self.place(op_id).await {
            Ok(Some(_)) => {
                self.publish_snapshot().await;
                self.persist().await;
                TickOutcome::Recreated
            }
            Ok(None) => TickOutcome::Skipped,
            Err(e) => {
                self.report(AlertLevel::Error, "place_order", side, &e).await;
                self.pause(op_id, OperationStatus::Paused, "could not recreate order").await
            }
        }
    }

    /// Fetch an order, retrying while the venue still reports it pending.
    async fn fetch_order(&self, order_id: &str) -> ExchangeResult<Order> {
        let symbol = self.state.lock().await.symbol_a.clone();
        let venue = self.venue_a.as_ref();
        let policy = RetryPolicy::reads(&self.ctx.config.retry);
        let site = CallSite::new("fetch_order", venue.venue_id(), &symbol);
        let pair = symbol.as_str();

        with_retry(&policy, site, move || async move {
            let order = venue.fetch_order(order_id, pair).await?;
            if order.status == OrderStatus::Pending {
                return Err(ExchangeError::Network("order is always processing".into()));
            }
            Ok(order)
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<Order> {
        let symbol = self.state.lock().await.symbol_a.clone();
        let venue = self.venue_a.as_ref();
        let policy = RetryPolicy::reads(&self.ctx.config.retry);
        let site = CallSite::new("cancel_order", venue.venue_id(), &symbol);
        let pair = symbol.as_str();
        with_retry(&policy, site, move || venue.cancel_order(order_id, pair)).await
    }

    /// Alert with the failing call's identity.
    async fn report(&self, level: AlertLevel, call: &'static str, side: Side, error: &ExchangeError) {
        let symbol = self.state.lock().await.symbol_a.clone();
        let site = CallSite::new(call, self.venue_a.venue_id(), &symbol).with_side(side);
        self.ctx
            .notifier
            .alert(level, format!("{} [{}]: {}", site, error.label(), error));
    }

    /// Stop driving the operation until something re-opens it.
    async fn pause(&self, op_id: &str, status: OperationStatus, reason: &str) -> TickOutcome {
        let reason_text = {
            let mut state = self.state.lock().await;
            let Some(op) = state.operation_mut(op_id) else {
                return TickOutcome::Skipped;
            };
            op.set_status(status, reason);
            op.reason.clone().unwrap_or_default()
        };
        info!(automation = %self.id(), operation = %op_id, status = %status, reason, "Operation stopped");
        self.persist().await;
        self.publish_fields(
            op_id,
            vec![
                FieldUpdate::new("status", status),
                FieldUpdate::new("reason", reason_text),
            ],
        );
        match status {
            OperationStatus::Finished => TickOutcome::Finished,
            _ => TickOutcome::Paused,
        }
    }
}
