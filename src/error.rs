//! Error taxonomy shared by the connectivity layer and the hedge coordinator.
//!
//! Transport and protocol failures are absorbed by sessions and connectors.
//! Business failures (rejections, fill timeouts) are surfaced to callers and
//! recorded on the opportunity record.

use thiserror::Error;

/// Errors produced by exchange connectors and their REST adapters.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure, connection drop, or request timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Exchange answered with a 5xx status. Always retryable.
    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    /// Exchange answered with a 4xx status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Response body or frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Exchange refused the order.
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    /// Order was not acknowledged or filled within its time budget.
    #[error("Order timed out after {elapsed_ms}ms")]
    OrderTimeout { elapsed_ms: u64 },

    /// Caller supplied an unusable request.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// No order with this id is known to the connector.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Operation needs API credentials that were not configured.
    #[error("No credentials configured for {0}")]
    Unauthenticated(String),

    /// REST reconciliation poll failed; previous state was retained.
    #[error("Sync error: {0}")]
    Sync(String),
}

impl ExchangeError {
    /// Whether the request may be repeated without changing its meaning.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::Server { .. })
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return ExchangeError::Server {
                    status: status.as_u16(),
                    body: err.to_string(),
                };
            }
        }
        if err.is_decode() {
            return ExchangeError::Protocol(ProtocolError::Malformed(err.to_string()));
        }
        ExchangeError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Transport(err.to_string())
    }
}

/// Malformed or unexpected wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unexpected frame: {0}")]
    Unexpected(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the hedge coordinator for requests it cannot act on.
///
/// Failures of an accepted attempt are not errors; they are reported through
/// [`crate::strategy::HedgeOutcome`] and the opportunity's state.
#[derive(Debug, Error)]
pub enum HedgeError {
    #[error("Invalid pair '{0}', expected exchange#symbol")]
    InvalidPair(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Opportunity {id} cannot {action} from state {state}")]
    InvalidState {
        id: String,
        action: &'static str,
        state: String,
    },

    #[error("Opportunity {0} is already being driven")]
    AlreadyInFlight(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Transport("reset".into()).is_retryable());
        assert!(ExchangeError::Server {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(!ExchangeError::OrderRejected {
            reason: "margin".into()
        }
        .is_retryable());
        assert!(!ExchangeError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }
}
