//! Registry of running automations.
//!
//! Starting an automation validates and normalizes the record, persists it
//! and hands it to an [`AutomationRuntime`]. Stopping tears the runtime down,
//! unless a book pass is in flight; then teardown waits for the pass to end
//! and is delivered back here through the teardown channel.

use crate::exchange::{
    with_retry, CallSite, ExchangeAdapter, ExchangeError, RetryPolicy, VenueRegistry,
};
use crate::notify::Event;
use crate::strategy::model::{Automation, ValidationError};
use crate::strategy::runtime::{AutomationRuntime, EngineContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid automation: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Venue(#[from] ExchangeError),

    #[error("automation {0} is already running")]
    AlreadyRunning(String),
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// A pass is running; teardown happens when it ends
    Deferred,
    NotFound,
}

pub struct Engine {
    venues: VenueRegistry,
    ctx: Arc<EngineContext>,
    live: Mutex<HashMap<String, Arc<AutomationRuntime>>>,
    /// Replacements for automations whose teardown was deferred
    waiting: Mutex<HashMap<String, Automation>>,
    teardown_tx: mpsc::UnboundedSender<String>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(venues: VenueRegistry, ctx: Arc<EngineContext>) -> Arc<Self> {
        let (teardown_tx, mut teardown_rx) = mpsc::unbounded_channel::<String>();
        let engine = Arc::new(Self {
            venues,
            ctx,
            live: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            teardown_tx,
            supervisor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let supervisor = tokio::spawn(async move {
            while let Some(id) = teardown_rx.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                engine.teardown(&id).await;
            }
        });
        *lock(&engine.supervisor) = Some(supervisor);
        engine
    }

    fn runtime(&self, id: &str) -> Option<Arc<AutomationRuntime>> {
        lock(&self.live).get(id).cloned()
    }

    fn venue(&self, id: &str) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        self.venues
            .get(id)
            .ok_or_else(|| ExchangeError::InvalidSymbol(format!("venue {} is not enabled", id)))
    }

    /// Validate, normalize, persist and run an automation.
    pub async fn start(&self, record: Automation) -> Result<(), EngineError> {
        record.validate()?;
        self.venues.market(&record.venue_a, &record.symbol_a)?;
        self.venues.market(&record.venue_b, &record.symbol_b)?;
        let venue_a = self.venue(&record.venue_a)?;
        let venue_b = self.venue(&record.venue_b)?;

        let mut automation = record;
        let had_orders = automation.normalize_for_start();

        let runtime = {
            let mut live = lock(&self.live);
            if live.contains_key(&automation.id) {
                return Err(EngineError::AlreadyRunning(automation.id));
            }
            let runtime = AutomationRuntime::new(
                automation.clone(),
                Arc::clone(&venue_a),
                venue_b,
                Arc::clone(&self.ctx),
                self.teardown_tx.clone(),
            );
            live.insert(automation.id.clone(), Arc::clone(&runtime));
            runtime
        };

        if had_orders {
            // orders left by a previous run; start does not wait for them
            let policy = RetryPolicy::reads(&self.ctx.config.retry);
            let symbol = automation.symbol_a.clone();
            tokio::spawn(async move { cancel_all(venue_a.as_ref(), &symbol, &policy).await });
        }

        if let Err(e) = self.ctx.store.save(&automation) {
            error!(automation = %automation.id, error = %e, "Failed to persist automation");
        }
        info!(automation = %automation.id, operations = automation.operations.len(), "Automation started");
        self.ctx.notifier.publish(Event::Automation {
            automation: Box::new(automation),
        });

        tokio::spawn(runtime.start());
        Ok(())
    }

    /// Stop an automation. Without `force`, a running pass defers teardown.
    pub async fn stop(&self, id: &str, force: bool) -> StopOutcome {
        let Some(runtime) = self.runtime(id) else {
            return StopOutcome::NotFound;
        };
        if runtime.request_delete() && !force {
            info!(automation = %id, "Stop deferred until the running pass ends");
            return StopOutcome::Deferred;
        }
        self.teardown(id).await;
        StopOutcome::Stopped
    }

    /// Replace an automation with `record`.
    ///
    /// An automation that is not running is simply started.
    pub async fn edit(&self, id: &str, mut record: Automation) -> Result<(), EngineError> {
        record.id = id.to_string();
        record.validate()?;

        lock(&self.waiting).insert(id.to_string(), record);
        if self.stop(id, false).await != StopOutcome::NotFound {
            // teardown starts the waiting record
            return Ok(());
        }
        let record = lock(&self.waiting).remove(id);
        match record {
            Some(record) => self.start(record).await,
            None => Ok(()),
        }
    }

    /// Start every persisted automation, spaced out to avoid request bursts.
    pub async fn load_all(&self) -> anyhow::Result<usize> {
        let records = self.ctx.store.load_all()?;
        let stagger = Duration::from_millis(self.ctx.config.engine.startup_stagger_ms);

        let mut started = 0;
        for (i, record) in records.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(stagger).await;
            }
            let id = record.id.clone();
            match self.start(record).await {
                Ok(()) => started += 1,
                Err(e) => error!(automation = %id, error = %e, "Failed to start stored automation"),
            }
        }
        Ok(started)
    }

    pub async fn get(&self, id: &str) -> Option<Automation> {
        let runtime = self.runtime(id)?;
        Some(runtime.snapshot().await)
    }

    /// Snapshots of every running automation, ordered by id.
    pub async fn list(&self) -> Vec<Automation> {
        let mut runtimes: Vec<Arc<AutomationRuntime>> = lock(&self.live).values().cloned().collect();
        runtimes.sort_by(|a, b| a.id().cmp(b.id()));

        let mut automations = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            automations.push(runtime.snapshot().await);
        }
        automations
    }

    /// Stop every consumer and timer, leaving orders and records in place
    /// for the next start.
    pub fn shutdown(&self) -> usize {
        let runtimes: Vec<Arc<AutomationRuntime>> = lock(&self.live).drain().map(|(_, r)| r).collect();
        for runtime in &runtimes {
            runtime.retire();
        }
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
        info!(automations = runtimes.len(), "Engine shut down");
        runtimes.len()
    }

    async fn teardown(&self, id: &str) -> bool {
        let Some(runtime) = lock(&self.live).remove(id) else {
            return false;
        };
        runtime.retire();

        if let Err(e) = self.ctx.store.delete(id) {
            error!(automation = %id, error = %e, "Failed to delete automation record");
        }
        self.ctx.notifier.publish(Event::Deleted {
            automation_id: id.to_string(),
        });

        let symbol = runtime.snapshot().await.symbol_a;
        let policy = RetryPolicy::reads(&self.ctx.config.retry);
        cancel_all(runtime.venue_a.as_ref(), &symbol, &policy).await;
        info!(automation = %id, venue = runtime.venue_a.venue_id(), symbol = %symbol, "Automation stopped");

        let replacement = lock(&self.waiting).remove(id);
        if let Some(record) = replacement {
            if let Err(e) = self.start(record).await {
                error!(automation = %id, error = %e, "Failed to restart edited automation");
            }
        }
        true
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Best-effort cancel of every open order on `symbol`.
async fn cancel_all(venue: &dyn ExchangeAdapter, symbol: &str, policy: &RetryPolicy) {
    let site = CallSite::new("cancel_all_orders", venue.venue_id(), symbol);
    if let Err(e) = with_retry(policy, site, move || venue.cancel_all_orders(symbol)).await {
        warn!(venue = venue.venue_id(), symbol, error = %e, "Failed to cancel open orders");
    }
}
