use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::utils::error::BrokerError;

pub type ConnectionId = String;

/// The role a connection announces in `HANDSHAKE_INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber,
    Broker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Broker => "broker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publisher" => Ok(Role::Publisher),
            "subscriber" => Ok(Role::Subscriber),
            "broker" => Ok(Role::Broker),
            other => Err(BrokerError::HandshakeRejected(format!(
                "unknown connection type: {other}"
            ))),
        }
    }
}

/// An admitted publisher or subscriber connection.
///
/// `id` is unique per socket; `username` is the identity used for topic
/// ownership and subscriptions, and may be shared by several connections.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ConnectionId,
    pub username: String,
    pub role: Role,
    /// Channel to the connection's writer task, one line per message.
    pub sender: UnboundedSender<String>,
}

impl Client {
    pub fn new(username: impl Into<String>, role: Role, sender: UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            role,
            sender,
        }
    }

    /// Queues a line for delivery. Returns `false` once the writer task is gone.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        self.sender.send(line.into()).is_ok()
    }
}
