//! Error taxonomy shared by every venue adapter.
//!
//! Adapters map their native failures into [`ExchangeError`]; the engine only
//! ever looks at [`ErrorKind`] to decide between retrying, recreating an
//! order, carrying a hedge amount forward, or pausing an operation.

use thiserror::Error;

/// Failure surfaced by any adapter call.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Timeouts, connection resets, 5xx and similar
    #[error("network error: {0}")]
    Network(String),

    /// Venue throttled the request
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Venue does not know the order (it may have lost it)
    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Order size or notional below the venue minimum
    #[error("amount below venue minimum: {0}")]
    BelowMinimum(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Venue rejected the request for a reason we do not classify
    #[error("venue rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Retry class of an [`ExchangeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    OrderNotFound,
    InsufficientFunds,
    BelowMinimum,
    Fatal,
}

impl ExchangeError {
    /// Classify the error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::RateLimited(_) => ErrorKind::Transient,
            Self::OrderNotFound { .. } => ErrorKind::OrderNotFound,
            Self::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            Self::BelowMinimum(_) => ErrorKind::BelowMinimum,
            Self::InvalidSymbol(_) | Self::Auth(_) | Self::Rejected { .. } | Self::Decode(_) => {
                ErrorKind::Fatal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short variant name used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network(_) => "NetworkError",
            Self::RateLimited(_) => "RateLimited",
            Self::OrderNotFound { .. } => "OrderNotFound",
            Self::InsufficientFunds(_) => "InsufficientFunds",
            Self::BelowMinimum(_) => "BelowMinimum",
            Self::InvalidSymbol(_) => "InvalidSymbol",
            Self::Auth(_) => "AuthError",
            Self::Rejected { .. } => "Rejected",
            Self::Decode(_) => "DecodeError",
        }
    }

    /// Classify an HTTP status that carried no more specific venue code.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 | 418 => Self::RateLimited(format!("HTTP {}: {}", status, body)),
            408 | 500..=599 => Self::Network(format!("HTTP {}: {}", status, body)),
            _ => Self::Rejected {
                code: status.to_string(),
                message: body.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return Self::Network(e.to_string());
        }
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), &e.to_string()),
            None => Self::Network(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ExchangeError::Network("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(ExchangeError::RateLimited("429".into()).kind(), ErrorKind::Transient);
        assert_eq!(
            ExchangeError::OrderNotFound { order_id: "1".into() }.kind(),
            ErrorKind::OrderNotFound
        );
        assert_eq!(
            ExchangeError::InsufficientFunds("BRL".into()).kind(),
            ErrorKind::InsufficientFunds
        );
        assert_eq!(ExchangeError::BelowMinimum("qty".into()).kind(), ErrorKind::BelowMinimum);
        assert_eq!(ExchangeError::Auth("bad key".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_from_status() {
        assert!(ExchangeError::from_status(429, "").is_transient());
        assert!(ExchangeError::from_status(503, "").is_transient());
        assert!(ExchangeError::from_status(524, "").is_transient());
        assert_eq!(ExchangeError::from_status(400, "bad").kind(), ErrorKind::Fatal);
    }
}
