//! Error types shared by the registry, the connection handlers and the mesh.
//!
//! Registry errors are rendered verbatim to the originating client as
//! `error: <message>`, so their `Display` text is part of the client protocol.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Topic with ID {0} already exists.")]
    TopicExists(String),

    #[error("Topic {0} does not exist.")]
    TopicNotFound(String),

    #[error("{user} is not the owner of topic {topic_id}.")]
    NotOwner { topic_id: String, user: String },

    #[error("{subscriber} is already subscribed to topic: {topic_id}")]
    AlreadySubscribed {
        topic_id: String,
        subscriber: String,
    },

    #[error("{subscriber} is not subscribed to topic: {topic_id}")]
    NotSubscribed {
        topic_id: String,
        subscriber: String,
    },

    #[error("{0}")]
    Usage(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("admission denied: {count} {role}s already connected (limit {limit})")]
    AdmissionDenied {
        role: String,
        count: usize,
        limit: usize,
    },

    #[error("admission timed out waiting for {0}")]
    AdmissionTimeout(String),

    #[error("lock denied by {0}")]
    LockDenied(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("directory service error: {0}")]
    Directory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
