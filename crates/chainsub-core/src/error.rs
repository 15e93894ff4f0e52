//! Error types for the subscription engine.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A request was attempted while the connection was not open.
    #[error("not connected")]
    NotConnected,

    /// Pending work was invalidated by an unexpected or explicit close.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No response arrived within the configured window.
    #[error("request timed out after {ms}ms")]
    RequestTimeout { ms: u64 },

    /// An inbound frame could not be decoded.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] DecodeError),

    /// The server rejected a subscribe or unsubscribe request.
    #[error("subscription rejected: {0}")]
    Subscription(JsonRpcError),

    /// The server returned an error for a plain request.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// WebSocket connect/send failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A request or result could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Shorthand for [`EngineError::ConnectionClosed`].
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::ConnectionClosed { .. }
                | Self::RequestTimeout { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the server itself rejected the request.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Subscription(_) | Self::Rpc(_))
    }
}

/// Reasons an inbound frame is dropped by the codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

/// A consumer sink failed while handling a payload.
///
/// Sink failures are isolated: they are reported on the event channel and
/// never reach the dispatch loop or the other sinks of a subscription.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sink returned an error: {0}")]
    Failed(String),

    #[error("sink panicked: {0}")]
    Panicked(String),
}
