//! Observer notifications.
//!
//! The engine publishes state changes as [`Event`]s, fire-and-forget. The
//! transport is outside this crate; [`BroadcastNotifier`] fans events out to
//! in-process subscribers and keeps the most recent alerts in memory.

use crate::strategy::Automation;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Alerts retained by [`AlertLog`].
pub const ALERT_LOG_CAPACITY: usize = 500;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

/// A timestamped alert message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub message: String,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.level {
            AlertLevel::Warning => warn!(target: "engine_alert", "ENGINE_ALERT: {}", json),
            AlertLevel::Error => error!(target: "engine_alert", "ENGINE_ALERT: {}", json),
        }
    }
}

/// One changed field of an operation or automation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdate {
    pub field: &'static str,
    pub value: Value,
}

impl FieldUpdate {
    pub fn new(field: &'static str, value: impl Serialize) -> Self {
        Self {
            field,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

/// State change published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Automation created or replaced; carries the full snapshot
    Automation { automation: Box<Automation> },
    /// Incremental change to one operation
    Operation {
        automation_id: String,
        operation_id: String,
        fields: Vec<FieldUpdate>,
    },
    /// Incremental change to an automation-level field
    AutomationField {
        automation_id: String,
        field: &'static str,
        value: Value,
    },
    Deleted { automation_id: String },
    Alert(Alert),
    ConversionRate { rate: Decimal },
}

/// Sink for engine events.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: Event);

    /// Publish an alert and emit it to the log.
    fn alert(&self, level: AlertLevel, message: String) {
        let alert = Alert::new(level, message);
        alert.emit();
        self.publish(Event::Alert(alert));
    }
}

/// Bounded, in-memory history of alerts.
#[derive(Debug)]
pub struct AlertLog {
    capacity: usize,
    entries: Mutex<VecDeque<Alert>>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// Alerts, oldest first.
    pub fn entries(&self) -> Vec<Alert> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(ALERT_LOG_CAPACITY)
    }
}

/// Fans events out over a tokio broadcast channel.
///
/// Publishing never blocks; slow subscribers lag and lose events.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
    alerts: AlertLog,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            alerts: AlertLog::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.entries()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: Event) {
        if let Event::Alert(alert) = &event {
            self.alerts.push(alert.clone());
        }
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
