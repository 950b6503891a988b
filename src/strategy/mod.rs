//! Market-making strategy.
//!
//! Contains the core logic for:
//! - The automation data model and its validation
//! - Min price and target price computation
//! - The per-operation order lifecycle (place, reposition, hedge, rebalance)
//! - The per-automation event loop and its watchdogs
//! - The registry that starts, stops and edits automations

mod conversion;
mod engine;
pub mod model;
mod orchestrator;
pub mod pricing;
mod runtime;
mod watchdog;

pub use conversion::ConversionFeed;
pub use engine::{Engine, EngineError, StopOutcome};
pub use model::{Automation, CachedQuote, Operation, OperationStatus, ValidationError};
pub use orchestrator::TickOutcome;
pub use runtime::{AutomationRuntime, EngineContext};
pub use watchdog::{WatchdogDelays, WatchdogEvent, Watchdogs};
