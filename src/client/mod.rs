//! The `client` module defines the broker-side view of a connected
//! publisher or subscriber.
//!
//! It provides the `Client` struct, which pairs a connection's identity and
//! role with the channel used to push lines to its socket, and the `Role`
//! announced in the handshake.

pub mod pubsub_client;
pub use pubsub_client::{Client, ConnectionId, Role};
