//! Venue integrations.
//!
//! ## Contract
//! [`ExchangeAdapter`] is the only surface the engine sees. Adapters return
//! normalized shapes and classify failures with [`ExchangeError`]; the
//! shared [`retry`] schedule decides what to do with them.
//!
//! ## Venues
//! - `mercado`: Mercado Bitcoin v4, REST plus WebSocket acceleration
//! - `binance`: Binance spot, signed REST plus public streams
//! - `mock`: in-memory venue for tests; `paper` mirrors a live venue's
//!   market data while simulating orders

pub mod binance;
pub mod error;
pub mod mercado;
pub mod mock;
pub mod paper;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod traits;
mod types;

pub use binance::BinanceClient;
pub use error::{ErrorKind, ExchangeError};
pub use mercado::MercadoClient;
pub use mock::{MockCall, MockExchange};
pub use paper::PaperExchange;
pub use rate_limiter::RateLimiter;
pub use registry::VenueRegistry;
pub use retry::{with_retry, CallSite, RetryPolicy};
pub use stream::MarketStream;
pub use traits::{ExchangeAdapter, ExchangeResult};
pub use types::*;
