//! Error taxonomy for the relay.
//!
//! Protocol errors never escape a single request: each variant maps to the
//! HTTP status returned to the caller that triggered it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure to relay one HTTP request through a tunnel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No open connection is registered for the identifier.
    #[error("client not connected")]
    TunnelUnavailable,

    /// The device did not reply before the deadline.
    #[error("tunnel timeout")]
    TunnelTimeout,

    /// The device replied with something that cannot become an HTTP response.
    #[error("malformed tunnel response: {0}")]
    MalformedEnvelope(String),

    /// Inbound body exceeds `server.max_body_bytes`.
    #[error("request body too large")]
    BodyTooLarge,

    /// The caller's body could not be read.
    #[error("failed to read request body: {0}")]
    RequestBody(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TunnelUnavailable | Self::MalformedEnvelope(_) => StatusCode::BAD_GATEWAY,
            Self::TunnelTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = match &self {
            // Device-supplied detail is logged, not echoed to the caller.
            Self::MalformedEnvelope(_) => "malformed tunnel response".to_string(),
            other => other.to_string(),
        };
        (self.status(), body).into_response()
    }
}

/// Startup configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A single device-agent connection attempt failed.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid upstream url {0}")]
    Upstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(RelayError::TunnelUnavailable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::TunnelTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            RelayError::MalformedEnvelope("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(RelayError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn messages_are_caller_facing() {
        assert_eq!(RelayError::TunnelUnavailable.to_string(), "client not connected");
        assert_eq!(RelayError::TunnelTimeout.to_string(), "tunnel timeout");
    }
}
