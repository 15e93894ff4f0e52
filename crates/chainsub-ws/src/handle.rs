//! Public subscription handle.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use chainsub_core::error::EngineError;
use chainsub_core::request::SubscriptionId;

use crate::connection::Command;
use crate::subscriptions::{SinkCell, SinkResult, SubscriptionKey, SubscriptionRegistry, SubscriptionState};

/// A live subscription returned by [`SubscriptionClient::subscribe`].
///
/// Payloads are buffered until read with [`next`](Self::next) (or through
/// the [`Stream`] impl), or pushed to a callback installed with
/// [`on_message`](Self::on_message). The stream ends once the subscription
/// is closed and the buffer is drained.
///
/// Dropping an active handle unsubscribes it in the background. The handle
/// does not keep the client alive.
///
/// [`SubscriptionClient::subscribe`]: crate::client::SubscriptionClient::subscribe
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    sink: Arc<SinkCell>,
    queue: Option<mpsc::UnboundedReceiver<Value>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    registry: SubscriptionRegistry,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        key: SubscriptionKey,
        sink: Arc<SinkCell>,
        queue: mpsc::UnboundedReceiver<Value>,
        commands: mpsc::WeakUnboundedSender<Command>,
        registry: SubscriptionRegistry,
    ) -> Self {
        Self {
            key,
            sink,
            queue: Some(queue),
            commands,
            registry,
        }
    }

    /// Local key of the subscription. Stable across reconnects.
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// Current server-assigned ID. `None` once closed, or while a replayed
    /// subscribe is awaiting its ack after a reconnect.
    pub fn id(&self) -> Option<SubscriptionId> {
        if self.sink.state() == SubscriptionState::Closed {
            return None;
        }
        self.registry.id_of(self.key)
    }

    pub fn state(&self) -> SubscriptionState {
        self.sink.state()
    }

    /// Why the subscription closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.sink.close_reason()
    }

    /// Wait for the next payload. Returns `None` once the subscription is
    /// closed and every buffered payload has been read, or after a callback
    /// was installed.
    pub async fn next(&mut self) -> Option<Value> {
        self.queue.as_mut()?.recv().await
    }

    /// Push payloads to `callback` instead of buffering them.
    ///
    /// Payloads already buffered are handed to the callback first, so none
    /// are lost or reordered. A callback that returns an error or panics is
    /// reported as an `EngineEvent::SinkFailed`; delivery to it continues.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(Value) -> SinkResult + Send + 'static,
    {
        let mut queue = self.queue.take();
        let drain = std::iter::from_fn(move || queue.as_mut()?.try_recv().ok());
        self.sink.install_callback(Box::new(callback), drain);
    }

    /// Cancel the subscription. Idempotent: calling it on a closed handle,
    /// or after the client is gone, succeeds without I/O.
    ///
    /// Other handles sharing the same server subscription are unaffected;
    /// the server is only told once the last one unsubscribes.
    ///
    /// While an earlier unsubscribe still awaits the server's ack this
    /// returns at once and leaves the state to that call.
    pub async fn unsubscribe(&self) -> Result<(), EngineError> {
        if self.sink.state() != SubscriptionState::Active {
            return Ok(());
        }
        let Some(commands) = self.commands.upgrade() else {
            self.sink.close("client dropped");
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        let sent = commands.send(Command::Unsubscribe {
            key: self.key,
            sink: self.sink.id(),
            reply,
        });
        drop(commands);
        if sent.is_err() {
            self.sink.close("client dropped");
            return Ok(());
        }
        let result = rx.await.unwrap_or(Ok(()));
        match &result {
            Ok(()) => self.sink.close("unsubscribed"),
            Err(e) => self.sink.close(&e.to_string()),
        }
        result
    }

    /// Alias for [`unsubscribe`](Self::unsubscribe).
    pub async fn close(&self) -> Result<(), EngineError> {
        self.unsubscribe().await
    }
}

impl Stream for SubscriptionHandle {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        match self.get_mut().queue.as_mut() {
            Some(queue) => queue.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.sink.state() != SubscriptionState::Active {
            return;
        }
        if let Some(commands) = self.commands.upgrade() {
            let (reply, _) = oneshot::channel();
            let _ = commands.send(Command::Unsubscribe {
                key: self.key,
                sink: self.sink.id(),
                reply,
            });
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("state", &self.sink.state())
            .finish()
    }
}
