use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

use super::node::BrokerNode;
use super::peer::{PeerHandler, PeerLink, PeerSet};
use crate::client::{Client, Role};
use crate::config::Settings;
use crate::directory::DirectoryService;
use crate::transport::message::PeerMessage;
use crate::utils::error::BrokerError;

/// Records what a link hands to its handler.
struct Recorder {
    events: mpsc::UnboundedSender<String>,
}

impl PeerHandler for Recorder {
    fn on_message(&self, _link: &Arc<PeerLink>, msg: PeerMessage) {
        let _ = self.events.send(msg.to_string());
    }

    fn on_closed(&self, link: &Arc<PeerLink>) {
        let _ = self.events.send(format!("closed {}", link.address()));
    }
}

/// The far end of a link under test.
struct Remote {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Remote {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for line")
            .unwrap()
            .expect("link closed")
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.lines.next_line()).await;
        assert!(next.is_err(), "unexpected line: {next:?}");
    }

    async fn expect_eof(&mut self) {
        let next = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for close");
        assert!(matches!(next, Ok(None) | Err(_)), "unexpected line: {next:?}");
    }
}

fn duplex_halves() -> (
    (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>),
    Remote,
) {
    let (local, remote) = tokio::io::duplex(4096);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    (
        (BufReader::new(local_read), local_write),
        Remote {
            lines: BufReader::new(remote_read).lines(),
            writer: remote_write,
        },
    )
}

fn linked(address: &str) -> (Arc<PeerLink>, Remote, mpsc::UnboundedReceiver<String>) {
    let (link, outbound) = PeerLink::new(address);
    let ((reader, writer), remote) = duplex_halves();
    let (tx, events) = mpsc::unbounded_channel();
    link.run(reader, writer, outbound, Arc::new(Recorder { events: tx }));
    (link, remote, events)
}

fn test_settings(pub_limit: usize, sub_limit: usize) -> Settings {
    let mut settings = Settings::default();
    settings.server.port = 0;
    settings.broker.total_pub_limit = pub_limit;
    settings.broker.total_sub_limit = sub_limit;
    settings.broker.admission_timeout_ms = 500;
    settings
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_replies_resolve_requests_in_order() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let timeout = Duration::from_secs(2);

    let requests = async {
        tokio::join!(
            link.request(PeerMessage::GetLocalSubscriberCount, timeout),
            link.request(PeerMessage::GetLocalSubscriberCount, timeout),
        )
    };
    let replies = async {
        assert_eq!(remote.recv().await, "get_local_subscriber_count");
        assert_eq!(remote.recv().await, "get_local_subscriber_count");
        remote.send("subscriber_count 3").await;
        remote.send("subscriber_count 7").await;
    };
    let ((first, second), ()) = tokio::join!(requests, replies);

    assert_eq!(first.unwrap(), PeerMessage::SubscriberCount(3));
    assert_eq!(second.unwrap(), PeerMessage::SubscriberCount(7));
}

#[tokio::test]
async fn test_reply_kinds_do_not_cross() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let timeout = Duration::from_secs(2);

    let requests = async {
        tokio::join!(
            link.request(PeerMessage::RequestLock, timeout),
            link.request(PeerMessage::GetLocalPublisherCount, timeout),
        )
    };
    let replies = async {
        remote.recv().await;
        remote.recv().await;
        remote.send("publisher_count 2").await;
        remote.send("lock_ack").await;
    };
    let ((lock, count), ()) = tokio::join!(requests, replies);

    assert_eq!(lock.unwrap(), PeerMessage::LockAck);
    assert_eq!(count.unwrap(), PeerMessage::PublisherCount(2));
}

#[tokio::test]
async fn test_request_without_reply_times_out() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let err = link
        .request(PeerMessage::RequestLock, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AdmissionTimeout(_)));
    assert_eq!(remote.recv().await, "request_lock");
}

#[tokio::test]
async fn test_timed_out_request_fails_the_link() {
    let (link, mut remote, mut events) = linked("127.0.0.1:9001");
    let err = link
        .request(PeerMessage::RequestLock, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AdmissionTimeout(_)));
    assert!(link.is_closed());

    // the answer arrives late and must not complete a newer request
    let _ = remote.writer.write_all(b"lock_ack\n").await;
    let next = link
        .request(PeerMessage::RequestLock, Duration::from_millis(50))
        .await;
    assert!(matches!(next, Err(BrokerError::PeerUnreachable(_))));

    assert_eq!(events.recv().await.unwrap(), "closed 127.0.0.1:9001");
    assert_eq!(remote.recv().await, "request_lock");
    remote.expect_eof().await;
}

#[tokio::test]
async fn test_request_fails_when_peer_disconnects() {
    let (link, remote, mut events) = linked("127.0.0.1:9001");
    let pending = link.request(PeerMessage::GetLocalPublisherCount, Duration::from_secs(2));
    let disconnect = async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(remote);
    };
    let (result, ()) = tokio::join!(pending, disconnect);

    assert!(matches!(result, Err(BrokerError::PeerUnreachable(_))));
    assert_eq!(events.recv().await.unwrap(), "closed 127.0.0.1:9001");
    assert!(link.is_closed());
    assert!(link.send(&PeerMessage::ReleaseLock).is_err());
}

#[tokio::test]
async fn test_commands_reach_handler_and_garbage_is_skipped() {
    let (_link, mut remote, mut events) = linked("127.0.0.1:9001");
    remote.send("bogus_command x").await;
    remote.send("synchronize_message t1 hello   there").await;
    remote.send("lock_ack").await;
    remote.send("synchronize_delete t1").await;

    assert_eq!(events.recv().await.unwrap(), "synchronize_message t1 hello   there");
    assert_eq!(events.recv().await.unwrap(), "synchronize_delete t1");
}

#[tokio::test]
async fn test_remote_lock_grant_and_release() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let lock = Arc::new(Mutex::new(()));

    link.grant_remote_lock(Arc::clone(&lock));
    assert_eq!(remote.recv().await, "lock_ack");
    assert!(link.holds_remote_lock());
    assert!(lock.try_lock().is_err());

    link.release_remote_lock();
    assert!(!link.holds_remote_lock());
    assert!(lock.try_lock().is_ok());
}

#[tokio::test]
async fn test_remote_lock_waits_for_local_holder() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let lock = Arc::new(Mutex::new(()));
    let local = Arc::clone(&lock).lock_owned().await;

    link.grant_remote_lock(Arc::clone(&lock));
    remote.expect_silence().await;

    drop(local);
    assert_eq!(remote.recv().await, "lock_ack");
    assert!(link.holds_remote_lock());
}

#[tokio::test]
async fn test_release_cancels_pending_grant() {
    let (link, mut remote, _events) = linked("127.0.0.1:9001");
    let lock = Arc::new(Mutex::new(()));
    let local = Arc::clone(&lock).lock_owned().await;

    link.grant_remote_lock(Arc::clone(&lock));
    link.release_remote_lock();
    drop(local);

    remote.expect_silence().await;
    assert!(!link.holds_remote_lock());
    assert!(lock.try_lock().is_ok());
}

#[tokio::test]
async fn test_closed_link_drops_its_lock() {
    let (link, mut remote, mut events) = linked("127.0.0.1:9001");
    let lock = Arc::new(Mutex::new(()));
    link.grant_remote_lock(Arc::clone(&lock));
    assert_eq!(remote.recv().await, "lock_ack");

    drop(remote);
    assert_eq!(events.recv().await.unwrap(), "closed 127.0.0.1:9001");
    assert!(lock.try_lock().is_ok());
}

#[test]
fn test_peer_set_keeps_one_link_per_address() {
    let peers = PeerSet::new();
    let (first, _rx1) = PeerLink::new("127.0.0.1:9002");
    let (second, _rx2) = PeerLink::new("127.0.0.1:9002");

    assert!(peers.accept_inbound("127.0.0.1:9001", Arc::clone(&first)));
    assert!(!peers.accept_inbound("127.0.0.1:9001", Arc::clone(&second)));
    assert!(!peers.begin_dial("127.0.0.1:9002"));

    // a stale link does not evict the registered one
    assert!(!peers.remove(&second));
    assert!(peers.contains("127.0.0.1:9002"));
    assert!(peers.remove(&first));
    assert!(peers.is_empty());
}

#[test]
fn test_peer_set_rejects_self_link() {
    let peers = PeerSet::new();
    let (link, _rx) = PeerLink::new("127.0.0.1:9001");
    assert!(!peers.accept_inbound("127.0.0.1:9001", link));
}

#[test]
fn test_simultaneous_dial_keeps_lower_address_connection() {
    // we are the lower address: our own dial wins, their dial is refused
    let low = PeerSet::new();
    assert!(low.begin_dial("127.0.0.1:9002"));
    let (theirs, _rx) = PeerLink::new("127.0.0.1:9002");
    assert!(!low.accept_inbound("127.0.0.1:9001", theirs));
    let (ours, _rx) = PeerLink::new("127.0.0.1:9002");
    assert!(low.finish_dial("127.0.0.1:9002", Some(ours)));

    // we are the higher address: their dial wins, ours is dropped
    let high = PeerSet::new();
    assert!(high.begin_dial("127.0.0.1:9001"));
    let (theirs, _rx) = PeerLink::new("127.0.0.1:9001");
    assert!(high.accept_inbound("127.0.0.1:9002", theirs));
    let (ours, _rx) = PeerLink::new("127.0.0.1:9001");
    assert!(!high.finish_dial("127.0.0.1:9001", Some(ours)));
    assert_eq!(high.len(), 1);
}

#[test]
fn test_flood_reaches_every_open_link() {
    let peers = PeerSet::new();
    let (a, mut rx_a) = PeerLink::new("127.0.0.1:9002");
    let (b, mut rx_b) = PeerLink::new("127.0.0.1:9003");
    let (c, rx_c) = PeerLink::new("127.0.0.1:9004");
    peers.accept_inbound("127.0.0.1:9001", a);
    peers.accept_inbound("127.0.0.1:9001", b);
    peers.accept_inbound("127.0.0.1:9001", c);
    drop(rx_c);

    let msg = PeerMessage::SyncDelete {
        topic_id: "t1".to_string(),
    };
    assert_eq!(peers.flood(&msg), 2);
    assert_eq!(rx_a.try_recv().unwrap(), "synchronize_delete t1");
    assert_eq!(rx_b.try_recv().unwrap(), "synchronize_delete t1");

    let order: Vec<String> = peers
        .snapshot()
        .iter()
        .map(|l| l.address().to_string())
        .collect();
    assert_eq!(order, vec!["127.0.0.1:9002", "127.0.0.1:9003", "127.0.0.1:9004"]);
}

#[tokio::test]
async fn test_standalone_admission_enforces_limit() {
    let node = BrokerNode::new(test_settings(1, 2));
    let (tx, _rx) = mpsc::unbounded_channel();

    node.admit(Client::new("bob", Role::Subscriber, tx.clone()))
        .await
        .unwrap();
    node.admit(Client::new("carol", Role::Subscriber, tx.clone()))
        .await
        .unwrap();
    let err = node
        .admit(Client::new("dave", Role::Subscriber, tx.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::AdmissionDenied {
            count: 2,
            limit: 2,
            ..
        }
    ));

    node.admit(Client::new("alice", Role::Publisher, tx.clone()))
        .await
        .unwrap();
    assert!(node
        .admit(Client::new("eve", Role::Publisher, tx))
        .await
        .is_err());
    assert_eq!(node.local_count(Role::Subscriber), 2);
    assert_eq!(node.local_count(Role::Publisher), 1);
}

#[tokio::test]
async fn test_admission_counts_peer_connections() {
    let node = BrokerNode::new(test_settings(5, 3));
    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");

    let (tx, _rx) = mpsc::unbounded_channel();
    let admit = node.admit(Client::new("bob", Role::Subscriber, tx));
    let peer = async {
        assert_eq!(remote.recv().await, "request_lock");
        remote.send("lock_ack").await;
        assert_eq!(remote.recv().await, "get_local_subscriber_count");
        remote.send("subscriber_count 3").await;
        assert_eq!(remote.recv().await, "release_lock");
    };
    let (result, ()) = tokio::join!(admit, peer);

    assert!(matches!(
        result,
        Err(BrokerError::AdmissionDenied { count: 3, .. })
    ));
    assert_eq!(node.local_count(Role::Subscriber), 0);
}

#[tokio::test]
async fn test_admission_fails_closed_when_peer_is_silent() {
    let mut settings = test_settings(5, 5);
    settings.broker.admission_timeout_ms = 100;
    let node = BrokerNode::new(settings);
    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = node
        .admit(Client::new("bob", Role::Subscriber, tx))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AdmissionTimeout(_)));

    // the peer that never answered is dropped, which frees any lock it granted
    assert_eq!(remote.recv().await, "request_lock");
    remote.expect_eof().await;
    wait_until(|| node.peer_count() == 0).await;
    assert_eq!(node.local_count(Role::Subscriber), 0);
}

#[tokio::test]
async fn test_late_lock_ack_is_not_taken_by_next_admission() {
    let mut settings = test_settings(5, 5);
    settings.broker.admission_timeout_ms = 100;
    let node = BrokerNode::new(settings);
    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = node
        .admit(Client::new("bob", Role::Subscriber, tx.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AdmissionTimeout(_)));
    assert_eq!(remote.recv().await, "request_lock");

    // the peer answers only after the admission gave up on it
    let _ = remote.writer.write_all(b"lock_ack\n").await;
    remote.expect_eof().await;
    wait_until(|| node.peer_count() == 0).await;

    // the next admission no longer involves the stale link
    node.admit(Client::new("carol", Role::Subscriber, tx))
        .await
        .unwrap();
    assert_eq!(node.local_count(Role::Subscriber), 1);
}

#[tokio::test]
async fn test_unreachable_broker_is_not_redialed_on_every_admission() {
    let directory = DirectoryService::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let directory_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&directory).serve(listener));

    // connections land in the backlog but no handshake is ever answered
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    directory.register(&dead_addr);

    let mut settings = test_settings(5, 5);
    settings.directory.address = Some(directory_addr);
    settings.broker.handshake_timeout_ms = 300;
    let node = BrokerNode::new(settings);
    let (tx, _rx) = mpsc::unbounded_channel();

    let started = Instant::now();
    node.admit(Client::new("bob", Role::Subscriber, tx.clone()))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(node.is_backing_off(&dead_addr));
    assert_eq!(node.peer_count(), 0);

    let started = Instant::now();
    node.admit(Client::new("carol", Role::Subscriber, tx))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(node.local_count(Role::Subscriber), 2);
}

#[tokio::test]
async fn test_node_applies_replication_and_answers_queries() {
    let node = BrokerNode::new(test_settings(5, 5));
    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");
    assert_eq!(node.peer_count(), 1);

    remote.send("synchronize_sub t1 bob").await;
    remote.send("synchronize_topic t1 news alice").await;
    wait_until(|| node.topic_exists("t1")).await;
    assert!(node.is_subscribed("t1", "bob"));

    remote.send("get_local_publisher_count").await;
    assert_eq!(remote.recv().await, "publisher_count 0");

    // replicated commands are not sent back
    remote.send("synchronize_delete t1").await;
    wait_until(|| !node.topic_exists("t1")).await;
    remote.expect_silence().await;
}

#[tokio::test]
async fn test_node_grants_lock_to_peer() {
    let node = BrokerNode::new(test_settings(5, 5));
    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");

    remote.send("request_lock").await;
    assert_eq!(remote.recv().await, "lock_ack");

    // local admission waits while the peer holds the lock
    let (tx, _rx) = mpsc::unbounded_channel();
    let admit = node.admit(Client::new("alice", Role::Publisher, tx));
    let peer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.send("release_lock").await;
        assert_eq!(remote.recv().await, "request_lock");
        remote.send("lock_ack").await;
        assert_eq!(remote.recv().await, "get_local_publisher_count");
        remote.send("publisher_count 0").await;
        assert_eq!(remote.recv().await, "release_lock");
    };
    let (result, ()) = tokio::join!(admit, peer);
    result.unwrap();
    assert_eq!(node.local_count(Role::Publisher), 1);
}

#[tokio::test]
async fn test_publisher_disconnect_deletes_topics_mesh_wide() {
    let node = BrokerNode::new(test_settings(5, 5));
    let (tx, _rx) = mpsc::unbounded_channel();
    let publisher = Client::new("alice", Role::Publisher, tx);
    let connection = publisher.id.clone();
    node.admit(publisher).await.unwrap();

    let ((reader, writer), mut remote) = duplex_halves();
    node.accept_peer("127.0.0.1:1", reader, writer).unwrap();
    assert_eq!(remote.recv().await, "HANDSHAKE_ACK");

    node.create_topic("alice", "t1", "news").unwrap();
    node.create_topic("alice", "t2", "sports").unwrap();
    assert_eq!(remote.recv().await, "synchronize_topic t1 news alice");
    assert_eq!(remote.recv().await, "synchronize_topic t2 sports alice");

    node.disconnect_client(&connection);
    assert!(!node.topic_exists("t1"));
    assert!(!node.topic_exists("t2"));
    assert_eq!(remote.recv().await, "synchronize_delete t1");
    assert_eq!(remote.recv().await, "synchronize_delete t2");
}

#[tokio::test]
async fn test_disconnect_keeps_state_while_identity_still_connected() {
    let node = BrokerNode::new(test_settings(5, 5));
    let (tx, _rx) = mpsc::unbounded_channel();
    let first = Client::new("bob", Role::Subscriber, tx.clone());
    let first_id = first.id.clone();
    node.admit(first).await.unwrap();
    node.admit(Client::new("bob", Role::Subscriber, tx))
        .await
        .unwrap();

    node.create_topic("alice", "t1", "news").unwrap();
    node.subscribe("bob", "t1").unwrap();
    node.disconnect_client(&first_id);
    assert!(node.is_subscribed("t1", "bob"));
}

#[test]
fn test_client_commands_are_authorized() {
    let node = BrokerNode::new(test_settings(5, 5));
    node.create_topic("alice", "t1", "news").unwrap();

    assert!(matches!(
        node.create_topic("bob", "t1", "other"),
        Err(BrokerError::TopicExists(_))
    ));
    assert!(matches!(
        node.publish("bob", "t1", "hi"),
        Err(BrokerError::NotOwner { .. })
    ));
    assert!(matches!(
        node.delete_topic("bob", "t1"),
        Err(BrokerError::NotOwner { .. })
    ));
    assert!(matches!(
        node.publish("alice", "t9", "hi"),
        Err(BrokerError::TopicNotFound(_))
    ));

    node.subscribe("bob", "t1").unwrap();
    assert!(matches!(
        node.subscribe("bob", "t1"),
        Err(BrokerError::AlreadySubscribed { .. })
    ));
    node.unsubscribe("bob", "t1").unwrap();
    assert!(matches!(
        node.unsubscribe("bob", "t1"),
        Err(BrokerError::NotSubscribed { .. })
    ));
    node.delete_topic("alice", "t1").unwrap();
    assert!(node.list_topics().is_empty());
}
