//! Connection manager: the background task that owns the WebSocket.
//!
//! All socket I/O, pending-table updates and registry mutations happen on
//! this task. Callers reach it through [`Command`]s and await `oneshot`
//! replies, so reconnect replay is naturally serialized with concurrent
//! subscribe/unsubscribe calls.
//!
//! Lifecycle:
//! - `Closed` → `Connecting`: first `ensure_connected`, or automatic reconnect
//! - `Connecting` → `Open`: handshake completed; subscriptions are replayed
//! - `Open` → `Closing` → `Closed`: explicit close
//! - `Open` → `Connecting`: unexpected close with reconnect enabled
//! - `Open` → `Closed`: unexpected close with reconnect disabled

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use chainsub_core::codec::WireCodec;
use chainsub_core::config::EngineConfig;
use chainsub_core::error::EngineError;
use chainsub_core::policy::ReconnectPolicy;
use chainsub_core::request::{JsonRpcRequest, SubscribeRequest, SubscriptionId};

use crate::events::{ConnectionState, EngineEvent};
use crate::pending::{PendingKind, PendingTable};
use crate::subscriptions::{Detach, SinkCell, SubscriptionKey, SubscriptionRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long an explicit close waits for the server's close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Command sent from callers to the connection task.
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Request {
        method: String,
        params: Option<Value>,
        reply: oneshot::Sender<Result<Value, EngineError>>,
    },
    Subscribe {
        request: SubscribeRequest,
        sink: Arc<SinkCell>,
        reply: oneshot::Sender<Result<SubscriptionKey, EngineError>>,
    },
    Unsubscribe {
        key: SubscriptionKey,
        sink: u64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

enum Phase {
    Idle,
    Connect { resume: bool },
    Exit,
}

/// A call or subscribe waiting for the socket to open.
struct Queued {
    method: String,
    params: Option<Value>,
    kind: PendingKind,
}

enum Online {
    Continue,
    Lost(String),
    Close(oneshot::Sender<()>),
    Exit,
}

pub(crate) struct ConnectionTask {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) codec: WireCodec,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) pending: PendingTable,
    pub(crate) registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<EngineEvent>,
    next_id: u64,
    /// Callers of `ensure_connected` sharing the in-flight attempt.
    waiters: Vec<oneshot::Sender<Result<(), EngineError>>>,
    /// Subscriptions acknowledged after their caller went away.
    pub(crate) orphans: Vec<(SubscriptionKey, u64)>,
    /// Server IDs acknowledged for subscriptions that no longer exist.
    pub(crate) stale: Vec<SubscriptionId>,
    /// Written once the socket is open, after the replay.
    queued: Vec<Queued>,
}

impl ConnectionTask {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        commands: mpsc::UnboundedReceiver<Command>,
        registry: SubscriptionRegistry,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            codec: WireCodec::new(config.envelope.clone()),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            pending: PendingTable::new(config.request_timeout()),
            config,
            commands,
            registry,
            state,
            events,
            next_id: 0,
            waiters: Vec::new(),
            orphans: Vec::new(),
            stale: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect { resume } => self.establish(resume).await,
                Phase::Exit => break,
            };
        }
        debug!(url = %self.config.url, "connection task stopped");
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(url = %self.config.url, from = %previous, to = %state, "connection state");
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ─── Closed ──────────────────────────────────────────────────────────────

    async fn idle(&mut self) -> Phase {
        self.set_state(ConnectionState::Closed);
        loop {
            let cmd = self.commands.recv().await;
            if let Some(phase) = self.handle_offline(cmd) {
                return phase;
            }
            if !self.waiters.is_empty() {
                return Phase::Connect { resume: false };
            }
        }
    }

    /// Handle a command while no socket is open.
    fn handle_offline(&mut self, cmd: Option<Command>) -> Option<Phase> {
        match cmd {
            None | Some(Command::Shutdown) => {
                self.teardown("client dropped");
                Some(Phase::Exit)
            }
            Some(Command::Connect { reply }) => {
                self.waiters.push(reply);
                None
            }
            Some(Command::Request {
                method,
                params,
                reply,
            }) => {
                self.enqueue(method, params, PendingKind::Call(reply));
                None
            }
            Some(Command::Subscribe {
                request,
                sink,
                reply,
            }) => {
                let (method, params) = (request.method.clone(), request.params.clone());
                let kind = PendingKind::Subscribe {
                    request,
                    sink,
                    reply,
                };
                self.enqueue(method, params, kind);
                None
            }
            Some(Command::Unsubscribe { key, sink, reply }) => {
                // The transport is gone, so the server side is gone too.
                if let Detach::Last(_) = self.registry.detach(key, sink) {
                    self.close_subscription(key, "unsubscribed");
                }
                let _ = reply.send(Ok(()));
                None
            }
            Some(Command::Close { reply }) => {
                self.teardown("closed by caller");
                let _ = reply.send(());
                Some(Phase::Idle)
            }
        }
    }

    /// Hold a request until the socket opens. Outside a connect attempt
    /// there is nothing to wait for, so the caller gets `NotConnected`.
    fn enqueue(&mut self, method: String, params: Option<Value>, kind: PendingKind) {
        if *self.state.borrow() != ConnectionState::Connecting {
            let _ = kind.reject(EngineError::NotConnected);
            return;
        }
        debug!(%method, "queued until connected");
        self.queued.push(Queued {
            method,
            params,
            kind,
        });
    }

    /// Drive `fut` to completion while still answering commands.
    /// Returns `Err` if a command ends the current phase.
    async fn offline_until<F: Future>(&mut self, fut: F) -> Result<F::Output, Phase> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                cmd = self.commands.recv() => {
                    if let Some(phase) = self.handle_offline(cmd) {
                        return Err(phase);
                    }
                }
            }
        }
    }

    // ─── Connecting ──────────────────────────────────────────────────────────

    async fn establish(&mut self, resume: bool) -> Phase {
        self.set_state(ConnectionState::Connecting);
        let config = Arc::clone(&self.config);
        // After an outage the first attempt already waits out a backoff delay.
        let mut attempt = u32::from(resume);
        let mut last_error: Option<String> = None;

        loop {
            if attempt > 0 {
                let Some(delay) = self.policy.next_delay(attempt) else {
                    let reason = match last_error {
                        Some(e) => format!("connect failed: {e}"),
                        None => "connection lost".to_string(),
                    };
                    warn!(url = %config.url, attempts = attempt - 1, %reason, "giving up on connection");
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Err(EngineError::WebSocket(reason.clone())));
                    }
                    self.teardown(&reason);
                    return Phase::Idle;
                };
                info!(url = %config.url, attempt, "reconnecting in {delay:?}");
                self.emit(EngineEvent::Reconnecting { attempt, delay });
                if let Err(phase) = self.offline_until(time::sleep(delay)).await {
                    return phase;
                }
            }

            info!(url = %config.url, "connecting via WebSocket");
            let connecting = time::timeout(config.request_timeout(), open_socket(&config));
            match self.offline_until(connecting).await {
                Err(phase) => return phase,
                Ok(Ok(Ok(socket))) => return self.serve(socket).await,
                Ok(Ok(Err(e))) => {
                    warn!(url = %config.url, error = %e, "WS connect failed");
                    last_error = Some(e.to_string());
                }
                Ok(Err(_)) => {
                    warn!(url = %config.url, "WS connect timed out");
                    last_error = Some(format!(
                        "connect timed out after {}ms",
                        config.request_timeout_ms
                    ));
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    // ─── Open ────────────────────────────────────────────────────────────────

    async fn serve(&mut self, socket: WsStream) -> Phase {
        let (mut sink, mut stream) = socket.split();

        self.set_state(ConnectionState::Open);
        info!(url = %self.config.url, "WebSocket connected");
        self.emit(EngineEvent::Connected {
            url: self.config.url.clone(),
        });
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if let Err(reason) = self.replay(&mut sink).await {
            return self.connection_lost(reason);
        }
        if let Err(reason) = self.flush_queued(&mut sink).await {
            return self.connection_lost(reason);
        }

        loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match self.handle_online(cmd, &mut sink).await {
                    Online::Continue => {}
                    Online::Lost(reason) => return self.connection_lost(reason),
                    Online::Close(reply) => {
                        self.set_state(ConnectionState::Closing);
                        close_socket(&mut sink, &mut stream).await;
                        self.teardown("closed by caller");
                        info!(url = %self.config.url, "WebSocket closed");
                        let _ = reply.send(());
                        return Phase::Idle;
                    }
                    Online::Exit => {
                        self.set_state(ConnectionState::Closing);
                        close_socket(&mut sink, &mut stream).await;
                        self.teardown("client dropped");
                        return Phase::Exit;
                    }
                },
                msg = stream.next() => {
                    let outcome = match msg {
                        Some(Ok(Message::Text(text))) => self.receive(text.as_str(), &mut sink).await,
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.receive(text, &mut sink).await,
                            Err(e) => {
                                self.decode_failed(format!("binary frame is not UTF-8: {e}"), "");
                                Ok(())
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            // Respond to server pings to keep the connection alive
                            sink.send(Message::Pong(data)).await.map_err(|e| e.to_string())
                        }
                        Some(Ok(Message::Close(frame))) => Err(match frame {
                            Some(f) => format!("closed by server ({}): {}", u16::from(f.code), f.reason),
                            None => "closed by server".to_string(),
                        }),
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => Err(e.to_string()),
                        None => Err("connection reset".to_string()),
                    };
                    if let Err(reason) = outcome {
                        return self.connection_lost(reason);
                    }
                },
                () = wait_until(deadline) => self.expire_pending(),
            }
        }
    }

    async fn handle_online(&mut self, cmd: Option<Command>, sink: &mut WsSink) -> Online {
        let outcome = match cmd {
            None | Some(Command::Shutdown) => return Online::Exit,
            Some(Command::Close { reply }) => return Online::Close(reply),
            Some(Command::Connect { reply }) => {
                let _ = reply.send(Ok(()));
                return Online::Continue;
            }
            Some(Command::Request {
                method,
                params,
                reply,
            }) => {
                let id = self.next_request_id();
                let req = self.codec.request(id, method, params);
                self.write(sink, req, PendingKind::Call(reply)).await
            }
            Some(Command::Subscribe {
                request,
                sink: cell,
                reply,
            }) => {
                if self.config.share_subscriptions {
                    if let Some(key) = self.registry.find_shared(&request) {
                        if self.registry.attach(key, Arc::clone(&cell)) {
                            debug!(%key, method = %request.method, "attached to shared subscription");
                            let _ = reply.send(Ok(key));
                            return Online::Continue;
                        }
                    }
                }
                let id = self.next_request_id();
                let req = self
                    .codec
                    .request(id, request.method.clone(), request.params.clone());
                let kind = PendingKind::Subscribe {
                    request,
                    sink: cell,
                    reply,
                };
                self.write(sink, req, kind).await
            }
            Some(Command::Unsubscribe {
                key,
                sink: sink_id,
                reply,
            }) => self.unsubscribe(sink, key, sink_id, reply).await,
        };
        match outcome {
            Ok(()) => Online::Continue,
            Err(reason) => Online::Lost(reason),
        }
    }

    /// Register `req` as pending and write it to the socket.
    /// `Err` carries the reason the connection must be treated as lost.
    async fn write(
        &mut self,
        sink: &mut WsSink,
        req: JsonRpcRequest,
        kind: PendingKind,
    ) -> Result<(), String> {
        let frame = match self.codec.encode(&req) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(key) = kind.reject(EngineError::Serialization(e)) {
                    self.close_subscription(key, "request could not be encoded");
                }
                return Ok(());
            }
        };
        if let Err(kind) =
            self.pending
                .register(req.id.clone(), req.method.clone(), req.params.clone(), kind)
        {
            warn!(id = %req.id, "request id already in flight");
            if let Some(key) = kind.reject(EngineError::closed("request id already in flight")) {
                self.close_subscription(key, "request id already in flight");
            }
            return Ok(());
        }
        debug!(id = %req.id, method = %req.method, "sending request");
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn unsubscribe(
        &mut self,
        sink: &mut WsSink,
        key: SubscriptionKey,
        sink_id: u64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) -> Result<(), String> {
        match self.registry.detach(key, sink_id) {
            Detach::Unknown | Detach::Remaining => {
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Detach::Last(id) => match (id, self.config.unsubscribe_method.clone()) {
                (Some(id), Some(method)) => {
                    let req_id = self.next_request_id();
                    let params = Value::Array(vec![id.to_value()]);
                    let req = self.codec.request(req_id, method, Some(params));
                    self.write(sink, req, PendingKind::Unsubscribe { key, reply })
                        .await
                }
                _ => {
                    self.close_subscription(key, "unsubscribed");
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
            },
        }
    }

    /// Ask the server to drop a subscription nobody listens to.
    async fn cancel_remote(&mut self, sink: &mut WsSink, id: SubscriptionId) -> Result<(), String> {
        let Some(method) = self.config.unsubscribe_method.clone() else {
            return Ok(());
        };
        debug!(%id, "cancelling stale server subscription");
        let req_id = self.next_request_id();
        let params = Value::Array(vec![id.to_value()]);
        let req = self.codec.request(req_id, method, Some(params));
        let (reply, _) = oneshot::channel();
        self.write(sink, req, PendingKind::Call(reply)).await
    }

    /// Process one text frame, then cancel any subscription whose caller
    /// stopped waiting for it.
    async fn receive(&mut self, text: &str, sink: &mut WsSink) -> Result<(), String> {
        self.handle_frame(text);
        for (key, sink_id) in std::mem::take(&mut self.orphans) {
            let (reply, _) = oneshot::channel();
            self.unsubscribe(sink, key, sink_id, reply).await?;
        }
        for id in std::mem::take(&mut self.stale) {
            self.cancel_remote(sink, id).await?;
        }
        Ok(())
    }

    /// Re-issue every registered subscribe request in creation order.
    async fn replay(&mut self, sink: &mut WsSink) -> Result<(), String> {
        let log = self.registry.replay_log();
        if log.is_empty() {
            return Ok(());
        }
        info!(url = %self.config.url, count = log.len(), "re-subscribing");
        for (key, request) in log {
            let id = self.next_request_id();
            let req = self.codec.request(id, request.method, request.params);
            self.write(sink, req, PendingKind::Resubscribe { key }).await?;
        }
        Ok(())
    }

    /// Write the calls and subscribes that arrived or were cut off while
    /// the socket was down, oldest first.
    async fn flush_queued(&mut self, sink: &mut WsSink) -> Result<(), String> {
        let mut queued = std::mem::take(&mut self.queued).into_iter();
        while let Some(entry) = queued.next() {
            if entry.kind.is_abandoned() {
                continue;
            }
            let id = self.next_request_id();
            let req = self.codec.request(id, entry.method, entry.params);
            if let Err(reason) = self.write(sink, req, entry.kind).await {
                self.queued.extend(queued);
                return Err(reason);
            }
        }
        Ok(())
    }

    // ─── Closing / Closed ────────────────────────────────────────────────────

    fn connection_lost(&mut self, reason: String) -> Phase {
        warn!(url = %self.config.url, %reason, pending = self.pending.len(), "WS disconnected");
        self.emit(EngineEvent::Disconnected {
            reason: reason.clone(),
        });
        let resume = self.policy.is_enabled();
        self.abandon_pending(&reason, resume);
        self.registry.clear_ids();
        if resume {
            Phase::Connect { resume: true }
        } else {
            self.teardown(&reason);
            Phase::Idle
        }
    }

    /// Settle every pending request after the socket went away.
    /// Replayed subscribes are left alone: they are replayed again.
    /// With `requeue`, calls and subscribes go back into the queue and are
    /// written again once a new socket is open.
    fn abandon_pending(&mut self, reason: &str, requeue: bool) {
        if self.pending.is_empty() {
            return;
        }
        let mut entries = self.pending.reject_all();
        entries.sort_by_key(|entry| entry.created);
        let mut requeued = Vec::new();
        for entry in entries {
            match entry.kind {
                PendingKind::Resubscribe { .. } => {}
                PendingKind::Unsubscribe { key, reply } => {
                    self.close_subscription(key, "unsubscribed");
                    let _ = reply.send(Ok(()));
                }
                kind if requeue => {
                    if !kind.is_abandoned() {
                        requeued.push(Queued {
                            method: entry.method,
                            params: entry.params,
                            kind,
                        });
                    }
                }
                kind => {
                    let _ = kind.reject(EngineError::closed(reason));
                }
            }
        }
        if !requeued.is_empty() {
            debug!(count = requeued.len(), "requests held for the next connection");
            requeued.append(&mut self.queued);
            self.queued = requeued;
        }
    }

    /// Settle all outstanding state and mark the connection `Closed`.
    fn teardown(&mut self, reason: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(EngineError::closed(reason)));
        }
        self.abandon_pending(reason, false);
        for entry in self.queued.drain(..) {
            let _ = entry.kind.reject(EngineError::closed(reason));
        }
        for key in self.registry.close_all(reason) {
            self.emit(EngineEvent::SubscriptionClosed {
                key,
                reason: reason.to_string(),
            });
        }
        self.set_state(ConnectionState::Closed);
    }

    pub(crate) fn close_subscription(&self, key: SubscriptionKey, reason: &str) {
        if self.registry.remove(key, reason) {
            debug!(%key, reason, "subscription closed");
            self.emit(EngineEvent::SubscriptionClosed {
                key,
                reason: reason.to_string(),
            });
        }
    }
}

async fn open_socket(config: &EngineConfig) -> Result<WsStream, EngineError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| EngineError::WebSocket(e.to_string()))?;
    if !config.protocols.is_empty() {
        let protocols = HeaderValue::from_str(&config.protocols.join(", "))
            .map_err(|e| EngineError::Config(format!("invalid subprotocol list: {e}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocols);
    }
    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| EngineError::WebSocket(e.to_string()))?;
    Ok(socket)
}

async fn close_socket(sink: &mut WsSink, stream: &mut WsSource) {
    if sink.send(Message::Close(None)).await.is_err() {
        return;
    }
    let _ = time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(msg)) = stream.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
