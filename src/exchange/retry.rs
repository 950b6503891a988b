//! Retry/backoff schedule shared by every adapter call.
//!
//! Attempts 1..=3 wait the short delay, later attempts the long delay, up to
//! a per-call cap. Exceeding the cap surfaces the last error.

use crate::config::RetryConfig;
use crate::exchange::error::{ErrorKind, ExchangeError};
use crate::exchange::types::Side;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff schedule and retry budget for one class of call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub short_delay: Duration,
    pub long_delay: Duration,
    /// Retries that use the short delay before switching to the long one
    pub short_attempts: u32,
    /// `None` retries transient failures forever
    pub max_retries: Option<u32>,
    /// Whether insufficient funds is retried like a transient failure
    pub retry_insufficient_funds: bool,
}

impl RetryPolicy {
    /// Policy for fetch/cancel calls.
    pub fn reads(config: &RetryConfig) -> Self {
        Self {
            short_delay: Duration::from_secs(config.short_delay_secs),
            long_delay: Duration::from_secs(config.long_delay_secs),
            short_attempts: config.short_attempts,
            max_retries: Some(config.max_attempts),
            retry_insufficient_funds: false,
        }
    }

    /// Policy for order placement; waits for balance to be replenished.
    pub fn placement(config: &RetryConfig, max_attempts: u32) -> Self {
        Self {
            max_retries: Some(max_attempts),
            retry_insufficient_funds: true,
            ..Self::reads(config)
        }
    }

    /// Policy for hedge placement: transient failures never give up.
    pub fn unbounded(config: &RetryConfig) -> Self {
        Self {
            max_retries: None,
            ..Self::reads(config)
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry <= self.short_attempts {
            self.short_delay
        } else {
            self.long_delay
        }
    }

    pub fn should_retry(&self, error: &ExchangeError) -> bool {
        match error.kind() {
            ErrorKind::Transient => true,
            ErrorKind::InsufficientFunds => self.retry_insufficient_funds,
            _ => false,
        }
    }

    fn budget_left(&self, retries: u32) -> bool {
        self.max_retries.map_or(true, |max| retries < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reads(&RetryConfig::default())
    }
}

/// Identity of an outbound call, used in retry logs and error reports.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub call: &'static str,
    pub venue: &'a str,
    pub symbol: &'a str,
    pub side: Option<Side>,
}

impl<'a> CallSite<'a> {
    pub fn new(call: &'static str, venue: &'a str, symbol: &'a str) -> Self {
        Self {
            call,
            venue,
            symbol,
            side: None,
        }
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }
}

impl fmt::Display for CallSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            Some(side) => write!(f, "{}() ({} | {} | {})", self.call, self.venue, self.symbol, side),
            None => write!(f, "{}() ({} | {})", self.call, self.venue, self.symbol),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's budget is exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    site: CallSite<'_>,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut retries = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(&e) && policy.budget_left(retries) => {
                retries += 1;
                debug!(
                    call = %site,
                    attempt = retries,
                    max = ?policy.max_retries,
                    error = %e,
                    "Retrying request"
                );
                tokio::time::sleep(policy.delay_for(retries)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
