//! Binance spot integration.

mod client;
mod types;
mod websocket;

pub use client::BinanceClient;
