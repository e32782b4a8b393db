//! Line grammars spoken on broker sockets.
//!
//! Every message is a single newline-terminated line of space-separated
//! tokens. Free-text payloads (`publish`, `synchronize_message`) keep
//! everything after the topic id verbatim.

use std::fmt;

use crate::client::Role;
use crate::utils::error::BrokerError;

pub const HANDSHAKE_INIT: &str = "HANDSHAKE_INIT";
pub const HANDSHAKE_ACK: &str = "HANDSHAKE_ACK";
/// Terminates multi-line replies (`list_all`, `current`, `get_brokers`).
pub const END: &str = "END";

/// `HANDSHAKE_INIT <identity> <role>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identity: String,
    pub role: Role,
}

impl Handshake {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    pub fn parse(line: &str) -> Result<Self, BrokerError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [HANDSHAKE_INIT, identity, role] => Ok(Self {
                identity: identity.to_string(),
                role: role.parse()?,
            }),
            _ => Err(BrokerError::HandshakeRejected(format!(
                "expected `{HANDSHAKE_INIT} <identity> <role>`, got {line:?}"
            ))),
        }
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HANDSHAKE_INIT} {} {}", self.identity, self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherCommand {
    Create { topic_id: String, name: String },
    Publish { topic_id: String, message: String },
    Show { topic_id: String },
    Delete { topic_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberCommand {
    Sub { topic_id: String },
    Unsub { topic_id: String },
    Current,
    ListAll,
}

/// A command from an admitted client, already checked against its role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Publisher(PublisherCommand),
    Subscriber(SubscriberCommand),
}

impl ClientCommand {
    pub fn parse(role: Role, line: &str) -> Result<Self, BrokerError> {
        match role {
            Role::Publisher => parse_publisher(line).map(ClientCommand::Publisher),
            Role::Subscriber => parse_subscriber(line).map(ClientCommand::Subscriber),
            Role::Broker => Err(BrokerError::Usage(
                "Unknown connection type.".to_string(),
            )),
        }
    }
}

fn usage(text: &str) -> BrokerError {
    BrokerError::Usage(format!("Usage: {text}"))
}

fn parse_publisher(line: &str) -> Result<PublisherCommand, BrokerError> {
    let (verb, rest) = split_verb(line);
    let args: Vec<&str> = rest.split_whitespace().collect();
    match verb {
        "create" => match args.as_slice() {
            [topic_id, name] => Ok(PublisherCommand::Create {
                topic_id: topic_id.to_string(),
                name: name.to_string(),
            }),
            _ => Err(usage("create {topic_id} {topic_name}")),
        },
        "publish" => match split_verb(rest) {
            (topic_id, message) if !topic_id.is_empty() && !message.is_empty() => {
                Ok(PublisherCommand::Publish {
                    topic_id: topic_id.to_string(),
                    message: message.to_string(),
                })
            }
            _ => Err(usage("publish {topic_id} {message}")),
        },
        "show" => match args.as_slice() {
            [topic_id] => Ok(PublisherCommand::Show {
                topic_id: topic_id.to_string(),
            }),
            _ => Err(usage("show {topic_id}")),
        },
        "delete" => match args.as_slice() {
            [topic_id] => Ok(PublisherCommand::Delete {
                topic_id: topic_id.to_string(),
            }),
            _ => Err(usage("delete {topic_id}")),
        },
        _ => Err(BrokerError::Usage(
            "Invalid command for publisher.".to_string(),
        )),
    }
}

fn parse_subscriber(line: &str) -> Result<SubscriberCommand, BrokerError> {
    let (verb, rest) = split_verb(line);
    let args: Vec<&str> = rest.split_whitespace().collect();
    match verb {
        "sub" => match args.as_slice() {
            [topic_id] => Ok(SubscriberCommand::Sub {
                topic_id: topic_id.to_string(),
            }),
            _ => Err(usage("sub {topic_id}")),
        },
        "unsub" => match args.as_slice() {
            [topic_id] => Ok(SubscriberCommand::Unsub {
                topic_id: topic_id.to_string(),
            }),
            _ => Err(usage("unsub {topic_id}")),
        },
        "current" => Ok(SubscriberCommand::Current),
        "list_all" => Ok(SubscriberCommand::ListAll),
        _ => Err(BrokerError::Usage(
            "Invalid command for subscriber.".to_string(),
        )),
    }
}

/// Splits off the first token; the remainder keeps its inner spacing.
fn split_verb(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim_start()),
        None => (line, ""),
    }
}

/// Which reply a peer request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    LockAck,
    SubscriberCount,
    PublisherCount,
}

/// Broker-to-broker replication and control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    SyncTopic {
        topic_id: String,
        name: String,
        owner: String,
    },
    SyncMessage {
        topic_id: String,
        message: String,
    },
    SyncSub {
        topic_id: String,
        subscriber: String,
    },
    SyncUnsub {
        topic_id: String,
        subscriber: String,
    },
    SyncDelete {
        topic_id: String,
    },
    RequestLock,
    ReleaseLock,
    GetLocalSubscriberCount,
    GetLocalPublisherCount,
    LockAck,
    SubscriberCount(usize),
    PublisherCount(usize),
}

impl PeerMessage {
    pub fn parse(line: &str) -> Result<Self, BrokerError> {
        let (verb, rest) = split_verb(line);
        let args: Vec<&str> = rest.split_whitespace().collect();
        let malformed = || BrokerError::Protocol(format!("invalid {verb} message: {line:?}"));

        let msg = match verb {
            "synchronize_topic" => match args.as_slice() {
                [topic_id, name, owner] => PeerMessage::SyncTopic {
                    topic_id: topic_id.to_string(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                },
                _ => return Err(malformed()),
            },
            "synchronize_message" => match split_verb(rest) {
                (topic_id, message) if !topic_id.is_empty() && !message.is_empty() => {
                    PeerMessage::SyncMessage {
                        topic_id: topic_id.to_string(),
                        message: message.to_string(),
                    }
                }
                _ => return Err(malformed()),
            },
            "synchronize_sub" | "synchronize_unsub" => match args.as_slice() {
                [topic_id, subscriber] if verb == "synchronize_sub" => PeerMessage::SyncSub {
                    topic_id: topic_id.to_string(),
                    subscriber: subscriber.to_string(),
                },
                [topic_id, subscriber] => PeerMessage::SyncUnsub {
                    topic_id: topic_id.to_string(),
                    subscriber: subscriber.to_string(),
                },
                _ => return Err(malformed()),
            },
            "synchronize_delete" => match args.as_slice() {
                [topic_id] => PeerMessage::SyncDelete {
                    topic_id: topic_id.to_string(),
                },
                _ => return Err(malformed()),
            },
            "request_lock" => PeerMessage::RequestLock,
            "release_lock" => PeerMessage::ReleaseLock,
            "get_local_subscriber_count" => PeerMessage::GetLocalSubscriberCount,
            "get_local_publisher_count" => PeerMessage::GetLocalPublisherCount,
            "lock_ack" => PeerMessage::LockAck,
            "subscriber_count" | "publisher_count" => {
                let count = match args.as_slice() {
                    [n] => n.parse::<usize>().map_err(|_| malformed())?,
                    _ => return Err(malformed()),
                };
                if verb == "subscriber_count" {
                    PeerMessage::SubscriberCount(count)
                } else {
                    PeerMessage::PublisherCount(count)
                }
            }
            other => {
                return Err(BrokerError::Protocol(format!(
                    "invalid command for broker: {other}"
                )));
            }
        };
        Ok(msg)
    }

    /// For requests, the kind of reply the sender should wait for.
    pub fn expected_response(&self) -> Option<ResponseKind> {
        match self {
            PeerMessage::RequestLock => Some(ResponseKind::LockAck),
            PeerMessage::GetLocalSubscriberCount => Some(ResponseKind::SubscriberCount),
            PeerMessage::GetLocalPublisherCount => Some(ResponseKind::PublisherCount),
            _ => None,
        }
    }

    /// For replies, the correlation slot they answer.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            PeerMessage::LockAck => Some(ResponseKind::LockAck),
            PeerMessage::SubscriberCount(_) => Some(ResponseKind::SubscriberCount),
            PeerMessage::PublisherCount(_) => Some(ResponseKind::PublisherCount),
            _ => None,
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::SyncTopic {
                topic_id,
                name,
                owner,
            } => write!(f, "synchronize_topic {topic_id} {name} {owner}"),
            PeerMessage::SyncMessage { topic_id, message } => {
                write!(f, "synchronize_message {topic_id} {message}")
            }
            PeerMessage::SyncSub {
                topic_id,
                subscriber,
            } => write!(f, "synchronize_sub {topic_id} {subscriber}"),
            PeerMessage::SyncUnsub {
                topic_id,
                subscriber,
            } => write!(f, "synchronize_unsub {topic_id} {subscriber}"),
            PeerMessage::SyncDelete { topic_id } => write!(f, "synchronize_delete {topic_id}"),
            PeerMessage::RequestLock => f.write_str("request_lock"),
            PeerMessage::ReleaseLock => f.write_str("release_lock"),
            PeerMessage::GetLocalSubscriberCount => f.write_str("get_local_subscriber_count"),
            PeerMessage::GetLocalPublisherCount => f.write_str("get_local_publisher_count"),
            PeerMessage::LockAck => f.write_str("lock_ack"),
            PeerMessage::SubscriberCount(n) => write!(f, "subscriber_count {n}"),
            PeerMessage::PublisherCount(n) => write!(f, "publisher_count {n}"),
        }
    }
}
