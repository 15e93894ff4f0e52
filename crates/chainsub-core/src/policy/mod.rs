//! Connection policies.
//!
//! Only the reconnect backoff lives here; it is consulted by the connection
//! task after every failed or lost connection.

pub mod backoff;

pub use backoff::ReconnectPolicy;
