//! Fiat conversion rate shared by every automation.
//!
//! Min prices of automations whose legs are quoted in different currencies
//! are converted with the latest rate. Until a rate is known those
//! automations skip quote handling.

use crate::config::{ConversionConfig, StreamConfig};
use crate::exchange::{with_retry, CallSite, ExchangeAdapter, RetryPolicy, VenueRegistry};
use crate::notify::{Event, Notifier};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owner of the conversion rate channel.
///
/// Dropping the feed stops its streaming task.
pub struct ConversionFeed {
    tx: watch::Sender<Option<Decimal>>,
    task: Option<JoinHandle<()>>,
}

impl ConversionFeed {
    /// A feed without a source; the rate is set by hand.
    pub fn manual() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, task: None }
    }

    pub fn fixed(rate: Decimal) -> Self {
        let (tx, _) = watch::channel(Some(rate));
        Self { tx, task: None }
    }

    /// Track `last` of `symbol` on `venue`.
    pub fn stream(
        venue: Arc<dyn ExchangeAdapter>,
        symbol: &str,
        streams: &StreamConfig,
        policy: RetryPolicy,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (tx, _) = watch::channel(None);
        let sender = tx.clone();
        let symbol = symbol.to_string();
        let streams = streams.clone();

        let task = tokio::spawn(async move {
            let venue_id = venue.venue_id().to_string();
            let site = CallSite::new("fetch_quote", &venue_id, &symbol);
            let (source, pair) = (venue.as_ref(), symbol.as_str());
            match with_retry(&policy, site, move || source.fetch_quote(pair)).await {
                Ok(quote) => publish(&sender, notifier.as_ref(), quote.last),
                Err(e) => warn!(venue = %venue_id, symbol = %symbol, error = %e, "Initial conversion rate unavailable"),
            }

            let mut quotes = Arc::clone(&venue).watch_quotes(&symbol, &streams);
            while let Some(quote) = quotes.next().await {
                publish(&sender, notifier.as_ref(), quote.last);
            }
            warn!(venue = %venue_id, symbol = %symbol, "Conversion rate stream ended");
        });

        Self {
            tx,
            task: Some(task),
        }
    }

    /// Build the feed described by `config`.
    pub fn from_config(
        config: &ConversionConfig,
        streams: &StreamConfig,
        policy: RetryPolicy,
        venues: &VenueRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        if let Some(rate) = config.fixed_rate {
            info!(rate = %rate, "Using fixed conversion rate");
            return Self::fixed(rate);
        }
        match config.venue.as_deref().and_then(|id| venues.get(id)) {
            Some(venue) => {
                info!(venue = venue.venue_id(), symbol = %config.symbol, "Streaming conversion rate");
                Self::stream(venue, &config.symbol, streams, policy, notifier)
            }
            None => {
                warn!("No conversion rate source; automations across quote currencies stay idle");
                Self::manual()
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Decimal>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Decimal> {
        *self.tx.borrow()
    }

    pub fn set(&self, rate: Decimal) {
        self.tx.send_replace(Some(rate));
    }
}

impl Drop for ConversionFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn publish(tx: &watch::Sender<Option<Decimal>>, notifier: &dyn Notifier, rate: Decimal) {
    if rate <= Decimal::ZERO {
        return;
    }
    let changed = tx.send_if_modified(|current| {
        if *current == Some(rate) {
            return false;
        }
        *current = Some(rate);
        true
    });
    if changed {
        debug!(rate = %rate, "Conversion rate updated");
        notifier.publish(Event::ConversionRate { rate });
    }
}
