//! Mercado Bitcoin integration.

mod client;
mod types;
mod websocket;

pub use client::MercadoClient;
