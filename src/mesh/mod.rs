//! Broker mesh: peer links, mesh-wide admission, and the node that ties
//! them to the local registry.

pub mod admission;
pub mod node;
pub mod peer;

pub use admission::AdmissionController;
pub use node::BrokerNode;
pub use peer::{PeerHandler, PeerLink, PeerSet};

#[cfg(test)]
mod tests;
