//! The `RpcTransport` trait — request/response over a transport.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::EngineError;

/// Transport health, derived from the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connection is open.
    Healthy,
    /// Connection is being (re-)established.
    Degraded,
    /// Connection is closed.
    Unhealthy,
    /// Health status is unknown (not yet checked).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A transport able to carry one-shot JSON-RPC calls.
///
/// Request IDs are allocated by the transport, not by the caller.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a request and return the `result` value of its response.
    async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError>;

    /// Return the current health status of this transport.
    fn health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    /// Convenience: call a method and deserialize the result.
    async fn call<T>(&self, method: &str, params: Option<Value>) -> Result<T, EngineError>
    where
        T: DeserializeOwned,
        Self: Sized,
    {
        let result = self.send(method, params).await?;
        serde_json::from_value(result).map_err(EngineError::Serialization)
    }
}
