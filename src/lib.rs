//! # meshsub
//!
//! `meshsub` is a distributed publish/subscribe broker. Several broker nodes
//! find each other through a directory service, link into a full mesh, and
//! replicate topics, subscriptions and messages to one another, while
//! jointly capping how many publishers and subscribers the whole mesh
//! admits.
//!
//! ## Core Modules
//!
//! - `broker`: the topic/subscription registry and its replication-aware mutations.
//! - `client`: the broker-side view of a connected publisher or subscriber.
//! - `config`: loading node configuration from files and the environment.
//! - `directory`: the broker directory service and its client.
//! - `mesh`: peer links, mesh-wide admission, and the broker node itself.
//! - `transport`: the line protocol, the accept loop, and per-connection handling.
//! - `utils`: shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod directory;
pub mod mesh;
pub mod transport;
pub mod utils;
