//! Per-operation watchdog timers.
//!
//! Every orchestrator tick re-arms three one-shot timers for the operation:
//! a keep-alive that forces a fresh book pass, a longer stall timer that only
//! raises an alert, and the go-back cooldown. Expired timers post a
//! [`WatchdogEvent`] to the automation's runtime instead of touching state.

use crate::config::EngineConfig;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// No tick for the keep-alive period
    KeepAlive(String),
    /// No tick for the stall period
    Stalled(String),
    /// Cooldown over; the order may return to the best price
    GoBack(String),
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogDelays {
    pub keep_alive: Duration,
    pub stalled: Duration,
    pub go_back: Duration,
}

impl From<&EngineConfig> for WatchdogDelays {
    fn from(config: &EngineConfig) -> Self {
        Self {
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            stalled: Duration::from_secs(config.stalled_secs),
            go_back: Duration::from_secs(config.go_back_secs),
        }
    }
}

/// Armed timers of one operation. Dropping them disarms every timer.
struct OperationTimers {
    handles: [JoinHandle<()>; 3],
}

impl OperationTimers {
    fn arm(op_id: &str, delays: WatchdogDelays, tx: &mpsc::UnboundedSender<WatchdogEvent>) -> Self {
        let timer = |delay: Duration, event: WatchdogEvent| {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            })
        };
        Self {
            handles: [
                timer(delays.keep_alive, WatchdogEvent::KeepAlive(op_id.to_string())),
                timer(delays.stalled, WatchdogEvent::Stalled(op_id.to_string())),
                timer(delays.go_back, WatchdogEvent::GoBack(op_id.to_string())),
            ],
        }
    }
}

impl Drop for OperationTimers {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Timer registry of one automation.
pub struct Watchdogs {
    delays: WatchdogDelays,
    tx: mpsc::UnboundedSender<WatchdogEvent>,
    timers: Mutex<HashMap<String, OperationTimers>>,
}

impl Watchdogs {
    pub fn new(delays: WatchdogDelays) -> (Self, mpsc::UnboundedReceiver<WatchdogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watchdogs = Self {
            delays,
            tx,
            timers: Mutex::new(HashMap::new()),
        };
        (watchdogs, rx)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, OperationTimers>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restart all timers of `op_id` from now.
    pub fn rearm(&self, op_id: &str) {
        let timers = OperationTimers::arm(op_id, self.delays, &self.tx);
        self.timers().insert(op_id.to_string(), timers);
    }

    /// Disarm every timer.
    pub fn clear(&self) {
        self.timers().clear();
    }

    /// Operations with armed timers.
    pub fn armed(&self) -> usize {
        self.timers().len()
    }
}
