//! Inbound frame handling for the connection task.
//!
//! Responses settle their pending entry; subscribe acks register the sink
//! before the next frame is read, so a notification that immediately
//! follows its ack is never dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use chainsub_core::codec::Frame;
use chainsub_core::error::{DecodeError, EngineError};
use chainsub_core::request::{JsonRpcResponse, Notification, SubscribeRequest, SubscriptionId};

use crate::connection::ConnectionTask;
use crate::events::EngineEvent;
use crate::pending::PendingKind;
use crate::subscriptions::{RemapError, SinkCell, SubscriptionKey};

/// Longest frame excerpt included in decode warnings.
const EXCERPT_CHARS: usize = 120;

impl ConnectionTask {
    pub(crate) fn handle_frame(&mut self, text: &str) {
        match self.codec.decode(text, |id| self.pending.contains(id)) {
            Ok(Frame::Response(response)) => self.settle(response),
            Ok(Frame::Notification(notification)) => self.deliver(notification),
            Err(e) => self.decode_failed(e.to_string(), text),
        }
    }

    pub(crate) fn decode_failed(&self, error: String, text: &str) {
        let excerpt: String = text.chars().take(EXCERPT_CHARS).collect();
        warn!(%error, frame = %excerpt, "dropping undecodable frame");
        self.emit(EngineEvent::DecodeFailed { error });
    }

    fn settle(&mut self, response: JsonRpcResponse) {
        let Some(entry) = self.pending.resolve(&response.id) else {
            return;
        };
        debug!(
            id = %response.id,
            method = %entry.method,
            elapsed = ?entry.created.elapsed(),
            "response received"
        );

        match entry.kind {
            PendingKind::Call(reply) => {
                let _ = reply.send(response.into_result().map_err(EngineError::Rpc));
            }
            PendingKind::Subscribe {
                request,
                sink,
                reply,
            } => {
                let sink_id = sink.id();
                let outcome = response
                    .into_result()
                    .map_err(EngineError::Subscription)
                    .and_then(|result| self.register(result, request, sink));
                if let Err(e) = &outcome {
                    warn!(method = %entry.method, error = %e, "subscribe failed");
                }
                if let Err(Ok(key)) = reply.send(outcome) {
                    debug!(%key, "subscriber went away before the ack, cancelling");
                    self.orphans.push((key, sink_id));
                }
            }
            PendingKind::Resubscribe { key } => self.resubscribed(key, response),
            PendingKind::Unsubscribe { key, reply } => {
                let result = response
                    .into_result()
                    .map(|_| ())
                    .map_err(EngineError::Subscription);
                match &result {
                    Ok(()) => self.close_subscription(key, "unsubscribed"),
                    Err(e) => self.close_subscription(key, &e.to_string()),
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Turn a subscribe ack into a registry entry.
    fn register(
        &self,
        result: Value,
        request: SubscribeRequest,
        sink: Arc<SinkCell>,
    ) -> Result<SubscriptionKey, EngineError> {
        let id = SubscriptionId::from_value(&result).ok_or_else(|| DecodeError::InvalidField {
            field: "result".into(),
            reason: format!("expected a subscription id, got {result}"),
        })?;
        let method = request.method.clone();
        let key = self.registry.insert(id.clone(), request, sink).ok_or_else(|| {
            DecodeError::InvalidField {
                field: "result".into(),
                reason: format!("subscription id {id} is already active"),
            }
        })?;
        info!(%key, %id, %method, "subscribed");
        Ok(key)
    }

    fn resubscribed(&mut self, key: SubscriptionKey, response: JsonRpcResponse) {
        let result = match response.into_result() {
            Ok(result) => result,
            Err(e) => {
                warn!(%key, error = %e, "resubscribe rejected");
                self.close_subscription(key, &format!("resubscribe rejected: {e}"));
                return;
            }
        };
        let Some(id) = SubscriptionId::from_value(&result) else {
            warn!(%key, %result, "resubscribe returned an invalid id");
            self.close_subscription(key, "resubscribe returned an invalid id");
            return;
        };
        match self.registry.remap(key, id.clone()) {
            Ok(()) => {
                info!(%key, %id, "resubscribed");
                self.emit(EngineEvent::Resubscribed { key, id });
            }
            // Unsubscribed while the replay was in flight; the server side
            // now exists again and must be cancelled.
            Err(RemapError::Gone) => {
                debug!(%key, %id, "resubscribe ack for a closed subscription");
                self.stale.push(id);
            }
            Err(RemapError::Duplicate) => {
                warn!(%key, %id, "resubscribe returned an id already in use");
                self.close_subscription(key, "server reused an active subscription id");
            }
        }
    }

    fn deliver(&mut self, notification: Notification) {
        let Notification {
            subscription,
            result,
            ..
        } = notification;
        let Some(delivery) = self.registry.dispatch(&subscription, result) else {
            debug!(%subscription, "notification for unknown subscription dropped");
            return;
        };
        trace!(key = %delivery.key, %subscription, sinks = delivery.delivered, "notification delivered");
        for error in delivery.failures {
            warn!(key = %delivery.key, %subscription, %error, "sink failed");
            self.emit(EngineEvent::SinkFailed {
                key: delivery.key,
                subscription: subscription.clone(),
                error: error.to_string(),
            });
        }
    }

    /// Fail every request whose deadline has passed.
    pub(crate) fn expire_pending(&mut self) {
        let ms = u64::try_from(self.pending.timeout().as_millis()).unwrap_or(u64::MAX);
        for (id, entry) in self.pending.expire(Instant::now()) {
            warn!(%id, method = %entry.method, "request timed out after {ms}ms");
            if let Some(key) = entry.kind.reject(EngineError::RequestTimeout { ms }) {
                self.close_subscription(key, "request timed out");
            }
        }
    }
}
