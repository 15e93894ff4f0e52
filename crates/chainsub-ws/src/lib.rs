//! chainsub-ws — multiplexed WebSocket subscription engine.
//!
//! # Features
//! - Any number of subscriptions over one JSON-RPC WebSocket connection
//! - Request/response correlation with per-request timeouts
//! - Auto-reconnect on disconnect (exponential backoff)
//! - Auto-resubscribe after reconnect, with server ID remapping
//! - Pull (`next` / `Stream`) or push (`on_message`) delivery per handle
//! - Fault-isolated sinks: a failing callback never stalls the others
//!
//! # Example
//!
//! ```no_run
//! use chainsub_core::{EngineConfig, SubscribeRequest};
//! use chainsub_ws::SubscriptionClient;
//!
//! # async fn run() -> Result<(), chainsub_core::EngineError> {
//! let client = SubscriptionClient::connect(EngineConfig::new("wss://node.example/ws")).await?;
//! let mut heads = client
//!     .subscribe(SubscribeRequest::new("subscribeForHeadBlockHash"))
//!     .await?;
//! while let Some(hash) = heads.next().await {
//!     println!("new head: {hash}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod events;
pub mod handle;
pub mod subscriptions;

mod connection;
mod dispatch;
mod pending;

pub use client::SubscriptionClient;
pub use events::{ConnectionState, EngineEvent};
pub use handle::SubscriptionHandle;
pub use subscriptions::{SinkResult, SubscriptionKey, SubscriptionRegistry, SubscriptionState};
