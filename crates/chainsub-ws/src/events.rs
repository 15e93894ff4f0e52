//! Observable engine events and connection state.

use std::time::Duration;

use chainsub_core::request::SubscriptionId;
use chainsub_core::transport::HealthStatus;

use crate::subscriptions::SubscriptionKey;

/// Lifecycle of the single underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn health(self) -> HealthStatus {
        match self {
            Self::Open => HealthStatus::Healthy,
            Self::Connecting | Self::Closing => HealthStatus::Degraded,
            Self::Closed => HealthStatus::Unhealthy,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Events broadcast by the connection task.
///
/// Failures that never reach a caller (decode errors, sink errors,
/// subscriptions closed by the engine) are only visible here.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected {
        url: String,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Resubscribed {
        key: SubscriptionKey,
        id: SubscriptionId,
    },
    SubscriptionClosed {
        key: SubscriptionKey,
        reason: String,
    },
    DecodeFailed {
        error: String,
    },
    SinkFailed {
        key: SubscriptionKey,
        subscription: SubscriptionId,
        error: String,
    },
}
