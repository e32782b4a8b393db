//! Topic and subscription state for one broker node.
//!
//! `Registry` is a synchronous structure meant to sit behind a lock owned by
//! the node. Callers must not hold that lock across network I/O; delivery to
//! local clients and flooding to peers only enqueue onto channels.

pub mod registry;
pub mod topic;

pub use registry::{Origin, Registry};
