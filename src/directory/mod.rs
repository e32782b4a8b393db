//! Broker directory: the registry of live broker addresses that nodes use
//! to find each other.
//!
//! The grammar is one request per TCP connection: `register <addr>`,
//! `deregister <addr>`, or `get_brokers`, which is answered with one address
//! per line followed by `END`.

pub mod client;
pub mod server;

pub use client::DirectoryClient;
pub use server::DirectoryService;
