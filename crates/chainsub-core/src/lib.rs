//! chainsub-core — wire types, codec and policies for chainsub.
//!
//! # Overview
//!
//! chainsub multiplexes any number of server-push subscriptions over a
//! single JSON-RPC WebSocket connection. The core crate defines:
//!
//! - [`WireCodec`] — request encoding and response/notification decoding
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`Notification`] — wire types
//! - [`EngineError`] / [`DecodeError`] / [`SinkError`] — structured errors
//! - [`EngineConfig`] — serde-loadable engine configuration
//! - [`policy`] module — reconnect backoff
//! - [`RpcTransport`] — one-shot call contract implemented by the engine

pub mod codec;
pub mod config;
pub mod error;
pub mod policy;
pub mod request;
pub mod transport;

pub use codec::{Frame, WireCodec};
pub use config::{EngineConfig, EnvelopeConfig, ReconnectConfig};
pub use error::{DecodeError, EngineError, SinkError};
pub use policy::ReconnectPolicy;
pub use request::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, Notification, RpcId, SubscribeRequest,
    SubscriptionId,
};
pub use transport::{HealthStatus, RpcTransport};
