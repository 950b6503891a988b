//! # Cross-Venue Maker
//!
//! Keeps resting limit orders on one venue, repositions them as the book
//! moves, and hedges every fill on a second venue.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue adapters, error taxonomy, retry and rate limiting
//! - `strategy`: Automations, pricing, order orchestration and the engine
//! - `notify`: Observer events and alerts
//! - `persistence`: SQLite storage for automation records
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod notify;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
