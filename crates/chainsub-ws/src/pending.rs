//! Pending request table.
//!
//! Every request written to the socket is registered here under its ID
//! together with a deadline and the waiter to settle. Entries leave the
//! table exactly once: on their response, on expiry, or on disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use chainsub_core::error::EngineError;
use chainsub_core::request::{RpcId, SubscribeRequest};

use crate::subscriptions::{SinkCell, SubscriptionKey};

/// What to do with a request's response.
pub(crate) enum PendingKind {
    /// Plain request: hand the result back to the caller.
    Call(oneshot::Sender<Result<Value, EngineError>>),
    /// Initial subscribe: register `sink` when the ack yields an ID.
    Subscribe {
        request: SubscribeRequest,
        sink: Arc<SinkCell>,
        reply: oneshot::Sender<Result<SubscriptionKey, EngineError>>,
    },
    /// Replayed subscribe after a reconnect: remap the existing entry.
    Resubscribe { key: SubscriptionKey },
    /// Server-side cancellation of the last sink of a subscription.
    Unsubscribe {
        key: SubscriptionKey,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

impl PendingKind {
    /// Fail the waiter with `error`.
    ///
    /// Returns the subscription that must be torn down as a consequence,
    /// if any.
    pub(crate) fn reject(self, error: EngineError) -> Option<SubscriptionKey> {
        match self {
            Self::Call(reply) => {
                let _ = reply.send(Err(error));
                None
            }
            Self::Subscribe { reply, .. } => {
                let _ = reply.send(Err(error));
                None
            }
            Self::Resubscribe { key } => Some(key),
            Self::Unsubscribe { key, reply } => {
                let _ = reply.send(Err(error));
                Some(key)
            }
        }
    }

    /// Whether the caller stopped waiting for the outcome.
    pub(crate) fn is_abandoned(&self) -> bool {
        match self {
            Self::Call(reply) => reply.is_closed(),
            Self::Subscribe { reply, .. } => reply.is_closed(),
            Self::Resubscribe { .. } | Self::Unsubscribe { .. } => false,
        }
    }
}

/// An in-flight request.
pub(crate) struct PendingRequest {
    pub(crate) method: String,
    /// Kept so the request can be written again after a reconnect.
    pub(crate) params: Option<Value>,
    pub(crate) kind: PendingKind,
    pub(crate) created: Instant,
    pub(crate) deadline: Instant,
}

/// Requests awaiting a response, keyed by request ID.
pub(crate) struct PendingTable {
    entries: HashMap<RpcId, PendingRequest>,
    timeout: Duration,
}

impl PendingTable {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Track a request. IDs must be unique among pending entries; a clash
    /// hands the waiter back to the caller untouched.
    pub(crate) fn register(
        &mut self,
        id: RpcId,
        method: impl Into<String>,
        params: Option<Value>,
        kind: PendingKind,
    ) -> Result<(), PendingKind> {
        if self.entries.contains_key(&id) {
            return Err(kind);
        }
        let created = Instant::now();
        self.entries.insert(
            id,
            PendingRequest {
                method: method.into(),
                params,
                kind,
                created,
                deadline: created + self.timeout,
            },
        );
        Ok(())
    }

    pub(crate) fn contains(&self, id: &RpcId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove the entry matching a response.
    pub(crate) fn resolve(&mut self, id: &RpcId) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Earliest deadline among pending entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(RpcId, PendingRequest)> {
        let expired: Vec<RpcId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect()
    }

    /// Drain the table on disconnect.
    pub(crate) fn reject_all(&mut self) -> Vec<PendingRequest> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
