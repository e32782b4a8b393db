//! The `transport` module carries the broker's newline-delimited text
//! protocol over TCP.
//!
//! It defines the line grammars spoken by clients and peer brokers, the
//! accept loop, and the per-connection state machine that performs the
//! handshake and forwards client commands to the broker node.

pub mod connection;
pub mod lines;
pub mod message;
pub mod server;
