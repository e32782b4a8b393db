//! Per-socket connection handling.
//!
//! Every accepted socket starts by sending `HANDSHAKE_INIT <identity> <role>`.
//! Brokers are handed to the node as peer links; publishers and subscribers
//! go through mesh-wide admission, are acknowledged, and then issue commands
//! until the socket closes, at which point their state is cleaned up.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{Client, Role};
use crate::mesh::BrokerNode;
use crate::transport::lines::spawn_line_writer;
use crate::transport::message::{
    ClientCommand, END, HANDSHAKE_ACK, Handshake, PublisherCommand, SubscriberCommand,
};
use crate::utils::error::BrokerError;

pub async fn handle_connection(stream: TcpStream, node: Arc<BrokerNode>) {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, write_half) = stream.into_split();
    handle_stream(BufReader::new(read_half), write_half, &remote, node).await;
}

/// Runs the connection state machine over any line-oriented stream.
pub async fn handle_stream<R, W>(mut reader: R, writer: W, remote: &str, node: Arc<BrokerNode>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let timeout = Duration::from_millis(node.settings().broker.handshake_timeout_ms);
    let handshake = match read_handshake(&mut reader, timeout).await {
        Ok(handshake) => handshake,
        Err(e) => {
            debug!(%remote, error = %e, "handshake failed, closing connection");
            return;
        }
    };

    if handshake.role == Role::Broker {
        if let Err(e) = node.accept_peer(&handshake.identity, reader, writer) {
            warn!(%remote, peer = %handshake.identity, error = %e, "broker link refused");
        }
        return;
    }

    let Handshake { identity, role } = handshake;
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    // queued first so it precedes anything delivered after admission
    let _ = tx.send(HANDSHAKE_ACK.to_string());

    let client = Client::new(identity.clone(), role, tx.clone());
    let connection = client.id.clone();
    if let Err(e) = node.admit(client).await {
        info!(%remote, user = %identity, %role, error = %e, "connection not admitted");
        return;
    }
    info!(%remote, user = %identity, %role, "client connected");

    spawn_line_writer(writer, rx, format!("{role} {identity}"), || {});

    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(user = %identity, %role, command = line, "received");
                for reply in dispatch(&node, &identity, role, line) {
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(user = %identity, %role, error = %e, "connection dropped abruptly");
                break;
            }
        }
    }

    node.disconnect_client(&connection);
}

async fn read_handshake<R>(reader: &mut R, timeout: Duration) -> Result<Handshake, BrokerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| BrokerError::HandshakeRejected("timed out".to_string()))??;
    if read == 0 {
        return Err(BrokerError::HandshakeRejected(
            "closed before handshake".to_string(),
        ));
    }
    Handshake::parse(line.trim())
}

/// Applies one command line and returns the lines to send back.
pub fn dispatch(node: &BrokerNode, user: &str, role: Role, line: &str) -> Vec<String> {
    let command = match ClientCommand::parse(role, line) {
        Ok(command) => command,
        Err(e) => return vec![format!("error: {e}")],
    };

    let outcome = match command {
        ClientCommand::Publisher(cmd) => publisher_command(node, user, cmd),
        ClientCommand::Subscriber(cmd) => subscriber_command(node, user, cmd),
    };
    outcome.unwrap_or_else(|e| vec![format!("error: {e}")])
}

fn publisher_command(
    node: &BrokerNode,
    user: &str,
    cmd: PublisherCommand,
) -> Result<Vec<String>, BrokerError> {
    let reply = match cmd {
        PublisherCommand::Create { topic_id, name } => {
            node.create_topic(user, &topic_id, &name)?;
            format!("success: Topic created: {name} (ID: {topic_id})")
        }
        PublisherCommand::Publish { topic_id, message } => {
            node.publish(user, &topic_id, &message)?;
            format!("success: Message published to topic: {topic_id}")
        }
        PublisherCommand::Show { topic_id } => {
            let count = node.subscriber_count(&topic_id)?;
            format!("Subscriber count for topic {topic_id}: {count}")
        }
        PublisherCommand::Delete { topic_id } => {
            node.delete_topic(user, &topic_id)?;
            format!("success: Topic {topic_id} has been deleted.")
        }
    };
    Ok(vec![reply])
}

fn subscriber_command(
    node: &BrokerNode,
    user: &str,
    cmd: SubscriberCommand,
) -> Result<Vec<String>, BrokerError> {
    let replies = match cmd {
        SubscriberCommand::Sub { topic_id } => {
            node.subscribe(user, &topic_id)?;
            vec![format!("success: {user} subscribed to topic: {topic_id}")]
        }
        SubscriberCommand::Unsub { topic_id } => {
            node.unsubscribe(user, &topic_id)?;
            vec![format!("success: {user} unsubscribed from topic: {topic_id}")]
        }
        SubscriberCommand::ListAll => {
            let topics = node.list_topics();
            let mut lines: Vec<String> = if topics.is_empty() {
                vec!["No topics available.".to_string()]
            } else {
                topics
                    .into_iter()
                    .map(|t| format!("Topic ID: {}, Name: {}, Publisher: {}", t.id, t.name, t.owner))
                    .collect()
            };
            lines.push(END.to_string());
            lines
        }
        SubscriberCommand::Current => {
            let subs = node.subscriptions_of(user);
            let mut lines: Vec<String> = if subs.is_empty() {
                vec!["No subscribed topics.".to_string()]
            } else {
                subs.into_iter()
                    .map(|(id, name)| format!("success: Subscribed to: {id} ({name})"))
                    .collect()
            };
            lines.push(END.to_string());
            lines
        }
    };
    Ok(replies)
}
