//! Subscription registry.
//!
//! Tracks every subscription by a stable local [`SubscriptionKey`], keeps
//! the original subscribe request for replay after a reconnect, and routes
//! notifications from the current server-assigned [`SubscriptionId`] to the
//! attached sinks.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

use chainsub_core::error::SinkError;
use chainsub_core::request::{SubscribeRequest, SubscriptionId};

/// Error type returned by callback sinks.
pub type SinkResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub(crate) type Callback = Box<dyn FnMut(Value) -> SinkResult + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stable local identifier of a subscription. Survives reconnects, unlike
/// the server-assigned ID. Keys grow monotonically, so ordering by key is
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(u64);

impl SubscriptionKey {
    #[cfg(test)]
    pub(crate) fn new(n: u64) -> Self {
        Self(n)
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a subscription (and of each handle attached to it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Unsubscribing,
    Closed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Unsubscribing => write!(f, "unsubscribing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

enum SinkTarget {
    Queue(mpsc::UnboundedSender<Value>),
    Callback(Callback),
    Detached,
}

struct SinkStatus {
    state: SubscriptionState,
    reason: Option<String>,
}

/// One consumer of a subscription: either a queue read through
/// `SubscriptionHandle::next`, or a callback installed with `on_message`.
pub(crate) struct SinkCell {
    id: u64,
    target: Mutex<SinkTarget>,
    status: Mutex<SinkStatus>,
}

impl SinkCell {
    pub(crate) fn queue(id: u64, tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            id,
            target: Mutex::new(SinkTarget::Queue(tx)),
            status: Mutex::new(SinkStatus {
                state: SubscriptionState::Active,
                reason: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        lock(&self.status).state
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        lock(&self.status).reason.clone()
    }

    fn set_state(&self, state: SubscriptionState) {
        let mut status = lock(&self.status);
        if status.state != SubscriptionState::Closed {
            status.state = state;
        }
    }

    /// Move to `Closed` and drop the target. Dropping a queue sender ends
    /// the handle's stream once buffered payloads are read. The first
    /// reason wins.
    pub(crate) fn close(&self, reason: &str) {
        {
            let mut status = lock(&self.status);
            if status.state == SubscriptionState::Closed {
                return;
            }
            status.state = SubscriptionState::Closed;
            status.reason = Some(reason.to_string());
        }
        *lock(&self.target) = SinkTarget::Detached;
    }

    /// Replace the target with `callback`, first feeding it everything
    /// `drain` yields (payloads buffered in the queue).
    pub(crate) fn install_callback(&self, mut callback: Callback, drain: impl Iterator<Item = Value>) {
        let mut target = lock(&self.target);
        for payload in drain {
            if let Err(e) = invoke(&mut callback, payload) {
                tracing::warn!(sink = self.id, error = %e, "sink failed on buffered payload");
            }
        }
        if !matches!(*target, SinkTarget::Detached) {
            *target = SinkTarget::Callback(callback);
        }
    }

    /// Deliver one payload. Callback errors and panics are caught here.
    pub(crate) fn deliver(&self, payload: Value) -> Result<(), SinkError> {
        let mut target = lock(&self.target);
        match &mut *target {
            SinkTarget::Queue(tx) => {
                // A dropped receiver means the handle went away; its drop
                // already queued the cancellation.
                let _ = tx.send(payload);
                Ok(())
            }
            SinkTarget::Callback(callback) => invoke(callback, payload),
            SinkTarget::Detached => Ok(()),
        }
    }
}

fn invoke(callback: &mut Callback, payload: Value) -> Result<(), SinkError> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SinkError::Failed(e.to_string())),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".into());
            Err(SinkError::Panicked(message))
        }
    }
}

struct SubscriptionEntry {
    /// Current server ID; `None` while waiting for a replayed ack.
    id: Option<SubscriptionId>,
    request: SubscribeRequest,
    sinks: Vec<Arc<SinkCell>>,
    state: SubscriptionState,
}

#[derive(Default)]
struct RegistryInner {
    next_key: u64,
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry>,
    index: HashMap<SubscriptionId, SubscriptionKey>,
}

/// Result of detaching one sink.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Detach {
    /// The subscription or sink is already gone.
    Unknown,
    /// Other sinks remain; the subscription stays active.
    Remaining,
    /// This was the last sink. The subscription is now `Unsubscribing`
    /// and carries its current server ID, if it has one.
    Last(Option<SubscriptionId>),
}

/// Outcome of routing one notification.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) key: SubscriptionKey,
    pub(crate) delivered: usize,
    pub(crate) failures: Vec<SinkError>,
}

/// Manages active subscriptions and supports re-subscription.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription under the server-assigned `id`.
    /// Refused if `id` already routes to another subscription.
    pub(crate) fn insert(
        &self,
        id: SubscriptionId,
        request: SubscribeRequest,
        sink: Arc<SinkCell>,
    ) -> Option<SubscriptionKey> {
        let mut inner = lock(&self.inner);
        if inner.index.contains_key(&id) {
            return None;
        }
        inner.next_key += 1;
        let key = SubscriptionKey(inner.next_key);
        inner.index.insert(id.clone(), key);
        inner.entries.insert(
            key,
            SubscriptionEntry {
                id: Some(id),
                request,
                sinks: vec![sink],
                state: SubscriptionState::Active,
            },
        );
        Some(key)
    }

    /// Find an active subscription created from an identical request.
    pub(crate) fn find_shared(&self, request: &SubscribeRequest) -> Option<SubscriptionKey> {
        lock(&self.inner)
            .entries
            .iter()
            .find(|(_, e)| e.state == SubscriptionState::Active && e.request == *request)
            .map(|(key, _)| *key)
    }

    /// Attach another sink to an active subscription.
    pub(crate) fn attach(&self, key: SubscriptionKey, sink: Arc<SinkCell>) -> bool {
        let mut inner = lock(&self.inner);
        match inner.entries.get_mut(&key) {
            Some(entry) if entry.state == SubscriptionState::Active => {
                entry.sinks.push(sink);
                true
            }
            _ => false,
        }
    }

    /// Forward a notification to every sink of the subscription, in
    /// registration order. Returns `None` for unknown or unsubscribing IDs.
    pub(crate) fn dispatch(&self, id: &SubscriptionId, payload: Value) -> Option<Delivery> {
        // Sinks run outside the registry lock so callbacks can query handles.
        let (key, sinks) = {
            let inner = lock(&self.inner);
            let key = *inner.index.get(id)?;
            let entry = inner.entries.get(&key)?;
            if entry.state != SubscriptionState::Active {
                return None;
            }
            (key, entry.sinks.clone())
        };

        let mut failures = Vec::new();
        let count = sinks.len();
        for sink in &sinks {
            if let Err(e) = sink.deliver(payload.clone()) {
                failures.push(e);
            }
        }
        Some(Delivery {
            key,
            delivered: count,
            failures,
        })
    }

    /// Detach one sink, closing it unless it is the last one (which moves
    /// the whole subscription to `Unsubscribing`).
    pub(crate) fn detach(&self, key: SubscriptionKey, sink_id: u64) -> Detach {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Detach::Unknown;
        };
        let Some(pos) = entry.sinks.iter().position(|s| s.id() == sink_id) else {
            return Detach::Unknown;
        };
        if entry.state != SubscriptionState::Active {
            return Detach::Unknown;
        }
        if entry.sinks.len() > 1 {
            let sink = entry.sinks.remove(pos);
            sink.close("unsubscribed");
            return Detach::Remaining;
        }
        entry.state = SubscriptionState::Unsubscribing;
        for sink in &entry.sinks {
            sink.set_state(SubscriptionState::Unsubscribing);
        }
        Detach::Last(entry.id.clone())
    }

    /// Remove a subscription and close its sinks. Returns `false` if it
    /// was already gone.
    pub(crate) fn remove(&self, key: SubscriptionKey, reason: &str) -> bool {
        let entry = {
            let mut inner = lock(&self.inner);
            let Some(entry) = inner.entries.remove(&key) else {
                return false;
            };
            if let Some(id) = &entry.id {
                inner.index.remove(id);
            }
            entry
        };
        for sink in &entry.sinks {
            sink.close(reason);
        }
        true
    }

    /// Remove every subscription. Returns the removed keys in creation order.
    pub(crate) fn close_all(&self, reason: &str) -> Vec<SubscriptionKey> {
        let entries = {
            let mut inner = lock(&self.inner);
            inner.index.clear();
            std::mem::take(&mut inner.entries)
        };
        entries
            .into_iter()
            .map(|(key, entry)| {
                for sink in &entry.sinks {
                    sink.close(reason);
                }
                key
            })
            .collect()
    }

    /// Forget all server IDs after a disconnect. Entries stay registered
    /// for replay; notifications cannot reach them until they are remapped.
    pub(crate) fn clear_ids(&self) {
        let mut inner = lock(&self.inner);
        inner.index.clear();
        for entry in inner.entries.values_mut() {
            entry.id = None;
        }
    }

    /// Subscribe requests to replay, in creation order.
    pub(crate) fn replay_log(&self) -> Vec<(SubscriptionKey, SubscribeRequest)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, e)| e.state == SubscriptionState::Active)
            .map(|(key, e)| (*key, e.request.clone()))
            .collect()
    }

    /// Point a subscription at a new server ID.
    ///
    /// Fails if the subscription is gone or `id` already routes elsewhere.
    pub(crate) fn remap(&self, key: SubscriptionKey, id: SubscriptionId) -> Result<(), RemapError> {
        let mut inner = lock(&self.inner);
        if let Some(owner) = inner.index.get(&id) {
            if *owner != key {
                return Err(RemapError::Duplicate);
            }
        }
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Err(RemapError::Gone);
        };
        let previous = entry.id.replace(id.clone());
        if let Some(previous) = previous {
            inner.index.remove(&previous);
        }
        inner.index.insert(id, key);
        Ok(())
    }

    /// Current server ID of a subscription.
    pub fn id_of(&self, key: SubscriptionKey) -> Option<SubscriptionId> {
        lock(&self.inner).entries.get(&key).and_then(|e| e.id.clone())
    }

    /// Whether `id` currently routes to a subscription.
    pub fn contains_id(&self, id: &SubscriptionId) -> bool {
        lock(&self.inner).index.contains_key(id)
    }

    /// Number of sinks attached to a subscription.
    pub fn sink_count(&self, key: SubscriptionKey) -> usize {
        lock(&self.inner)
            .entries
            .get(&key)
            .map_or(0, |e| e.sinks.len())
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Returns `true` if there are no registered subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RemapError {
    Gone,
    Duplicate,
}
