//! Multiplexed WebSocket subscription client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use chainsub_core::config::EngineConfig;
use chainsub_core::error::EngineError;
use chainsub_core::request::SubscribeRequest;
use chainsub_core::transport::{HealthStatus, RpcTransport};

use crate::connection::{Command, ConnectionTask};
use crate::events::{ConnectionState, EngineEvent};
use crate::handle::SubscriptionHandle;
use crate::subscriptions::{SinkCell, SubscriptionRegistry};

/// Capacity of the event broadcast channel. Slow event readers lag rather
/// than stall the connection task.
const EVENT_CAPACITY: usize = 256;

/// WebSocket JSON-RPC subscription client.
///
/// Maintains a background task that owns the single WebSocket connection,
/// multiplexes requests and subscriptions over it, and handles reconnect
/// and re-subscribe transparently.
///
/// Nothing is dialed until the first call that needs the socket. After
/// [`close`](Self::close) the client stays closed until the next such call.
/// Dropping the client closes the connection and every subscription.
pub struct SubscriptionClient {
    config: Arc<EngineConfig>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<EngineEvent>,
    registry: SubscriptionRegistry,
    next_sink: AtomicU64,
}

impl SubscriptionClient {
    /// Validate `config` and start the background task. Must be called
    /// inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = SubscriptionRegistry::new();

        let task = ConnectionTask::new(
            Arc::clone(&config),
            cmd_rx,
            registry.clone(),
            state_tx,
            events.clone(),
        );
        tokio::spawn(task.run());

        Ok(Self {
            config,
            cmd_tx,
            state,
            events,
            registry,
            next_sink: AtomicU64::new(1),
        })
    }

    /// Create a client and open its connection.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let client = Self::new(config)?;
        client.ensure_connected().await?;
        Ok(client)
    }

    /// Open the connection if it is not open yet. Concurrent callers share
    /// one attempt; if the connection is already open this returns at once.
    ///
    /// Failed attempts are retried under the reconnect policy before an
    /// error is returned.
    pub async fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Subscribe with `request`, connecting first if needed.
    ///
    /// Resolves once the server acknowledges the subscription; the handle
    /// is registered before any later frame is processed, so no
    /// notification following the ack is lost.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscriptionHandle, EngineError> {
        self.ensure_connected().await?;
        let (tx, queue) = mpsc::unbounded_channel();
        let sink = Arc::new(SinkCell::queue(
            self.next_sink.fetch_add(1, Ordering::Relaxed),
            tx,
        ));
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            request,
            sink: Arc::clone(&sink),
            reply,
        })?;
        let key = rx.await.map_err(|_| stopped())??;
        Ok(SubscriptionHandle::new(
            key,
            sink,
            queue,
            self.cmd_tx.downgrade(),
            self.registry.clone(),
        ))
    }

    /// Send a one-shot request and return its `result`, connecting first
    /// if needed.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        self.ensure_connected().await?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            method: method.to_string(),
            params,
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Close the connection. Pending requests fail with
    /// `ConnectionClosed` and every subscription is closed. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), EngineError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| stopped())
    }

    /// Subscribe to engine events. Events sent before this call are not
    /// replayed.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Number of registered subscriptions (shared ones count once).
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    fn command(&self, cmd: Command) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).map_err(|_| stopped())
    }
}

fn stopped() -> EngineError {
    EngineError::closed("connection task stopped")
}

impl Drop for SubscriptionClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

#[async_trait]
impl RpcTransport for SubscriptionClient {
    async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        self.request(method, params).await
    }

    fn health(&self) -> HealthStatus {
        self.state().health()
    }

    fn url(&self) -> &str {
        &self.config.url
    }
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}
