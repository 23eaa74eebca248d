//! Error types for the broker adapter contract.
//!
//! Every adapter operation returns [`BrokerResult<T>`]. The variants map to
//! the engine's propagation policy:
//!
//! - **Transient / Timeout / Http** — retried with backoff by the trade actor
//! - **Rejection** — terminal for the order; the trade is rejected
//! - **SessionExpired** — the token watchdog reloads credentials; in-flight
//!   callers retry after the reload
//! - **InvalidArgument / NotConnected** — caller bugs or lifecycle misuse

use std::time::Duration;

/// Structured error body returned by a broker REST API.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl std::fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.error_code.as_deref().unwrap_or("UNKNOWN"),
            self.error_type.as_deref().unwrap_or("Unknown Error"),
            self.message.as_deref().unwrap_or("no message"),
        )
    }
}

/// All possible errors produced by a broker adapter.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Temporary failure (network, 5xx, rate limit). Safe to retry.
    #[error("transient broker failure: {0}")]
    Transient(String),

    /// The operation exceeded its mandatory timeout.
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused the request. Terminal for that order.
    #[error("broker rejection: [{code}] {message}")]
    Rejection { code: String, message: String },

    /// The access token is no longer valid; the watchdog must reload it.
    #[error("broker session expired")]
    SessionExpired,

    /// The adapter is not connected.
    #[error("broker not connected")]
    NotConnected,

    /// A network or transport-level error from `reqwest`.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to deserialize a response body.
    #[error("response parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A WebSocket-level error on the tick stream.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The caller provided an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BrokerError {
    /// Whether the trade actor should retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::Http(_) | Self::WebSocket(_)
        )
    }

    pub fn rejection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejection {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the broker layer.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Transient("503".into()).is_transient());
        assert!(BrokerError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!BrokerError::rejection("RMS", "margin insufficient").is_transient());
        assert!(!BrokerError::SessionExpired.is_transient());
        assert!(!BrokerError::NotConnected.is_transient());
    }

    #[test]
    fn api_error_display() {
        let body = ApiErrorBody {
            error_type: Some("OrderException".to_string()),
            error_code: Some("RMS-101".to_string()),
            message: Some("margin insufficient".to_string()),
        };
        assert_eq!(
            body.to_string(),
            "[RMS-101] OrderException: margin insufficient"
        );
    }
}
