// Error handling module
// Defines the benchmark error taxonomy and its HTTP mapping for the mock broker

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the benchmark core.
///
/// None of these are fatal to a running harness: each is handled inside the
/// component that detects it.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Malformed configuration or argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection refused, reset, or a backend-reported connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single publish attempt failed while the connection was up
    #[error("Publish error: {0}")]
    Publish(String),

    /// Malformed or unparseable inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BenchError {
    /// Whether this error means the underlying connection is gone
    pub fn is_transport(&self) -> bool {
        matches!(self, BenchError::Transport(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            BenchError::InvalidArgument(_) => "invalid_argument",
            BenchError::Transport(_) => "transport_error",
            BenchError::Publish(_) => "publish_error",
            BenchError::Protocol(_) => "protocol_error",
        }
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        BenchError::Protocol(err.to_string())
    }
}

impl IntoResponse for BenchError {
    fn into_response(self) -> Response {
        let status = match &self {
            BenchError::InvalidArgument(_) | BenchError::Protocol(_) => StatusCode::BAD_REQUEST,
            BenchError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BenchError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        tracing::debug!(status = %status, error = %self, "Rejecting broker request");

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BenchError::InvalidArgument("size must be positive".to_string());
        assert_eq!(err.to_string(), "Invalid argument: size must be positive");

        let err = BenchError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "Transport error: connection refused");

        let err = BenchError::Publish("503 Service Unavailable".to_string());
        assert_eq!(err.to_string(), "Publish error: 503 Service Unavailable");
    }

    #[test]
    fn test_is_transport() {
        assert!(BenchError::Transport("reset".into()).is_transport());
        assert!(!BenchError::Publish("boom".into()).is_transport());
        assert!(!BenchError::Protocol("bad frame".into()).is_transport());
    }

    #[test]
    fn test_json_error_becomes_protocol_error() {
        let err: BenchError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, BenchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_error_response_conversion() {
        let response = BenchError::Protocol("bad body".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = BenchError::InvalidArgument("empty stream".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = BenchError::Publish("hub closed".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = BenchError::Transport("down".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
