//! Wire codec: request encoding and inbound frame classification.
//!
//! An inbound frame whose `id` belongs to a pending request is a
//! [`Frame::Response`]. Every other frame is a [`Frame::Notification`] and
//! must carry the configured `params.subscription` / `params.result` fields.

use serde_json::{Map, Value};

use crate::config::EnvelopeConfig;
use crate::error::DecodeError;
use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Notification, RpcId, SubscriptionId};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(JsonRpcResponse),
    Notification(Notification),
}

/// Encoder/decoder parameterised by the envelope configuration.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    envelope: EnvelopeConfig,
}

impl WireCodec {
    pub fn new(envelope: EnvelopeConfig) -> Self {
        Self { envelope }
    }

    /// Build a request stamped with the configured version tag.
    pub fn request(&self, id: u64, method: impl Into<String>, params: Option<Value>) -> JsonRpcRequest {
        let mut req = JsonRpcRequest::new(id, method, params);
        req.jsonrpc = self.envelope.jsonrpc.clone();
        req
    }

    /// Serialize a request to a text frame.
    pub fn encode(&self, req: &JsonRpcRequest) -> Result<String, serde_json::Error> {
        serde_json::to_string(req)
    }

    /// Decode a text frame. `is_pending` reports whether an ID belongs to an
    /// in-flight request; only those frames are treated as responses.
    pub fn decode(
        &self,
        text: &str,
        is_pending: impl Fn(&RpcId) -> bool,
    ) -> Result<Frame, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if let Some(id) = obj.get("id").and_then(RpcId::from_value) {
            if is_pending(&id) {
                return decode_response(id, obj).map(Frame::Response);
            }
        }

        self.decode_notification(obj).map(Frame::Notification)
    }

    fn decode_notification(&self, mut obj: Map<String, Value>) -> Result<Notification, DecodeError> {
        let env = &self.envelope;
        let mut params = match obj.remove(&env.params_field) {
            Some(Value::Object(params)) => params,
            Some(_) => {
                return Err(DecodeError::InvalidField {
                    field: env.params_field.clone(),
                    reason: "expected an object".into(),
                })
            }
            None => return Err(DecodeError::MissingField(env.params_field.clone())),
        };

        let subscription = match params.get(&env.subscription_field) {
            Some(raw) => SubscriptionId::from_value(raw).ok_or_else(|| DecodeError::InvalidField {
                field: env.subscription_field.clone(),
                reason: "expected a string or unsigned integer".into(),
            })?,
            None => return Err(DecodeError::MissingField(env.subscription_field.clone())),
        };

        let result = params
            .remove(&env.result_field)
            .ok_or_else(|| DecodeError::MissingField(env.result_field.clone()))?;

        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            _ => None,
        };

        Ok(Notification {
            method,
            subscription,
            result,
        })
    }
}

fn decode_response(id: RpcId, mut obj: Map<String, Value>) -> Result<JsonRpcResponse, DecodeError> {
    if let Some(raw) = obj.remove("error") {
        let error: JsonRpcError =
            serde_json::from_value(raw).map_err(|e| DecodeError::InvalidField {
                field: "error".into(),
                reason: e.to_string(),
            })?;
        return Ok(JsonRpcResponse::failure(id, error));
    }
    match obj.remove("result") {
        Some(result) => Ok(JsonRpcResponse::success(id, result)),
        None => Err(DecodeError::MissingField("result".into())),
    }
}
