//! Broker node
//!
//! The composition root of one broker: it owns the registry, the peer set
//! and the admission controller, applies client commands (authorizing them
//! and flooding the resulting replication command), applies replication
//! commands from peers, and keeps the peer set in step with the directory.
//!
//! Lock order: the registry lock may be held while the peer set lock is
//! taken (flooding happens under the registry lock so every peer sees
//! mutations in the order they were applied here), never the reverse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::topic::{TopicId, TopicSummary};
use crate::broker::{Origin, Registry};
use crate::client::{Client, Role};
use crate::config::Settings;
use crate::directory::DirectoryClient;
use crate::mesh::admission::AdmissionController;
use crate::mesh::peer::{PeerHandler, PeerLink, PeerSet};
use crate::transport::lines::write_line;
use crate::transport::message::{HANDSHAKE_ACK, Handshake, PeerMessage};
use crate::transport::server::serve;
use crate::utils::error::{BrokerError, Result};

pub struct BrokerNode {
    address: String,
    settings: Settings,
    registry: Mutex<Registry>,
    peers: PeerSet,
    admission: AdmissionController,
    directory: Option<DirectoryClient>,
    stopping: AtomicBool,
    /// Directory entries whose last dial failed, and when.
    dial_failures: Mutex<HashMap<String, Instant>>,
}

impl BrokerNode {
    pub fn new(settings: Settings) -> Arc<Self> {
        let directory = settings
            .directory
            .address
            .as_ref()
            .map(|addr| DirectoryClient::new(addr.clone()));
        Arc::new(Self {
            address: settings.advertised_address(),
            admission: AdmissionController::new(&settings.broker),
            registry: Mutex::new(Registry::new()),
            peers: PeerSet::new(),
            directory,
            settings,
            stopping: AtomicBool::new(false),
            dial_failures: Mutex::new(HashMap::new()),
        })
    }

    /// Binds the listening socket and builds the node around it. A port of
    /// 0 is replaced by the one the OS picked, so the advertised address is
    /// always dialable.
    pub async fn bind(mut settings: Settings) -> Result<(Arc<Self>, TcpListener)> {
        let listener = TcpListener::bind((settings.server.host.as_str(), settings.server.port)).await?;
        settings.server.port = listener.local_addr()?.port();
        Ok((Self::new(settings), listener))
    }

    /// Registers with the directory, links with the brokers it lists, keeps
    /// refreshing that list in the background, and serves connections.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Some(directory) = &self.directory {
            match directory.register_broker(&self.address).await {
                Ok(()) => info!(address = %self.address, directory = %directory.address(), "registered with directory"),
                Err(e) => warn!(error = %e, "failed to register with directory"),
            }
        }
        self.refresh_peers().await;
        self.spawn_discovery();
        serve(listener, self).await;
    }

    /// Stops discovery, removes this broker from the directory and closes
    /// every peer link.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for link in self.peers.snapshot() {
            link.close();
        }
        if let Some(directory) = &self.directory {
            if let Err(e) = directory.deregister_broker(&self.address).await {
                warn!(error = %e, "failed to deregister from directory");
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flood(&self, msg: Option<PeerMessage>) {
        if let Some(msg) = msg {
            let sent = self.peers.flood(&msg);
            debug!(command = %msg, peers = sent, "flooded");
        }
    }

    // ---- queries ----

    pub fn topic_exists(&self, topic_id: &str) -> bool {
        self.registry().exists(topic_id)
    }

    pub fn is_subscribed(&self, topic_id: &str, who: &str) -> bool {
        self.registry().is_subscribed(topic_id, who)
    }

    pub fn local_count(&self, role: Role) -> usize {
        self.registry().local_count(role)
    }

    pub fn subscriber_count(&self, topic_id: &str) -> Result<usize> {
        self.registry().subscriber_count(topic_id)
    }

    pub fn list_topics(&self) -> Vec<TopicSummary> {
        self.registry().list_topics()
    }

    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<(TopicId, String)> {
        self.registry().subscriptions_of(subscriber)
    }

    // ---- client commands ----

    pub fn create_topic(&self, owner: &str, topic_id: &str, name: &str) -> Result<()> {
        let mut registry = self.registry();
        let flood = registry.create_topic(owner, topic_id, name, &Origin::Local)?;
        self.flood(flood);
        Ok(())
    }

    pub fn publish(&self, caller: &str, topic_id: &str, message: &str) -> Result<()> {
        let registry = self.registry();
        ensure_owner(&registry, topic_id, caller)?;
        let flood = registry.publish(topic_id, message, &Origin::Local)?;
        self.flood(flood);
        Ok(())
    }

    pub fn delete_topic(&self, caller: &str, topic_id: &str) -> Result<()> {
        let mut registry = self.registry();
        ensure_owner(&registry, topic_id, caller)?;
        let flood = registry.delete_topic(topic_id, &Origin::Local)?;
        self.flood(flood);
        Ok(())
    }

    pub fn subscribe(&self, subscriber: &str, topic_id: &str) -> Result<()> {
        let mut registry = self.registry();
        if !registry.exists(topic_id) {
            return Err(BrokerError::TopicNotFound(topic_id.to_string()));
        }
        if registry.is_subscribed(topic_id, subscriber) {
            return Err(BrokerError::AlreadySubscribed {
                topic_id: topic_id.to_string(),
                subscriber: subscriber.to_string(),
            });
        }
        let flood = registry.subscribe(topic_id, subscriber, &Origin::Local)?;
        self.flood(flood);
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber: &str, topic_id: &str) -> Result<()> {
        let mut registry = self.registry();
        if !registry.is_subscribed(topic_id, subscriber) {
            return Err(BrokerError::NotSubscribed {
                topic_id: topic_id.to_string(),
                subscriber: subscriber.to_string(),
            });
        }
        let flood = registry.unsubscribe(topic_id, subscriber, &Origin::Local)?;
        self.flood(flood);
        Ok(())
    }

    // ---- connection lifecycle ----

    /// Runs mesh-wide admission for a new publisher or subscriber and, on
    /// success, adds it to the active set.
    pub async fn admit(self: &Arc<Self>, client: Client) -> Result<()> {
        self.refresh_peers().await;
        self.admission.admit(self, client).await
    }

    /// Cleans up after a client socket closed: a publisher's topics are
    /// deleted and a subscriber's subscriptions dropped, mesh-wide. Nothing
    /// is cleaned up while another local connection still uses the identity.
    pub fn disconnect_client(&self, client_id: &str) {
        let mut registry = self.registry();
        let Some(client) = registry.remove_client(client_id) else {
            return;
        };
        info!(user = %client.username, role = %client.role, "client disconnected");
        if registry.has_connection(&client.username, client.role) {
            return;
        }

        match client.role {
            Role::Publisher => {
                for topic_id in registry.topics_owned_by(&client.username) {
                    match registry.delete_topic(&topic_id, &Origin::Local) {
                        Ok(flood) => {
                            info!(topic = %topic_id, publisher = %client.username, "deleted topic of departed publisher");
                            self.flood(flood);
                        }
                        Err(e) => warn!(topic = %topic_id, error = %e, "cleanup delete failed"),
                    }
                }
            }
            Role::Subscriber => {
                for (topic_id, _) in registry.subscriptions_of(&client.username) {
                    match registry.unsubscribe(&topic_id, &client.username, &Origin::Local) {
                        Ok(flood) => self.flood(flood),
                        Err(e) => warn!(topic = %topic_id, error = %e, "cleanup unsubscribe failed"),
                    }
                }
            }
            Role::Broker => {}
        }
    }

    // ---- peers ----

    /// Adopts a socket whose handshake named it a broker and acknowledges it.
    pub fn accept_peer<R, W>(self: &Arc<Self>, address: &str, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_stopping() {
            return Err(BrokerError::HandshakeRejected("broker is shutting down".to_string()));
        }
        let (link, outbound) = PeerLink::new(address);
        if !self.peers.accept_inbound(&self.address, Arc::clone(&link)) {
            return Err(BrokerError::HandshakeRejected(format!(
                "already linked with broker {address}"
            )));
        }
        link.send_line(HANDSHAKE_ACK)?;
        link.run(reader, writer, outbound, Arc::clone(self));
        info!(peer = %address, "broker connected");
        Ok(())
    }

    /// Dials a peer broker unless it is this node or already linked.
    pub async fn connect_to_peer(self: &Arc<Self>, address: &str) -> Result<()> {
        if address == self.address || !self.peers.begin_dial(address) {
            return Ok(());
        }

        let (reader, writer) = match self.dial(address).await {
            Ok(halves) => halves,
            Err(e) => {
                self.peers.finish_dial(address, None);
                self.failures().insert(address.to_string(), Instant::now());
                return Err(e);
            }
        };
        self.failures().remove(address);

        let (link, outbound) = PeerLink::new(address);
        if !self.peers.finish_dial(address, Some(Arc::clone(&link))) {
            debug!(peer = %address, "link established concurrently, dropping dial");
            return Ok(());
        }
        link.run(reader, writer, outbound, Arc::clone(self));
        info!(peer = %address, "connected to broker");
        Ok(())
    }

    async fn dial(
        &self,
        address: &str,
    ) -> Result<(BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf)> {
        let timeout = Duration::from_millis(self.settings.broker.handshake_timeout_ms);
        let unreachable = |_| BrokerError::PeerUnreachable(address.to_string());

        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(unreachable)?
            .map_err(|e| BrokerError::PeerUnreachable(format!("{address}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = Handshake::new(self.address.clone(), Role::Broker);
        write_line(&mut write_half, &hello.to_string()).await?;

        let mut ack = String::new();
        tokio::time::timeout(timeout, reader.read_line(&mut ack))
            .await
            .map_err(unreachable)??;
        if ack.trim_end() != HANDSHAKE_ACK {
            return Err(BrokerError::HandshakeRejected(format!(
                "broker {address} answered {:?}",
                ack.trim_end()
            )));
        }
        Ok((reader, write_half))
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.dial_failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a recent dial to `address` failed and it is not retried yet.
    pub fn is_backing_off(&self, address: &str) -> bool {
        let backoff = Duration::from_secs(self.settings.directory.dial_backoff_secs);
        let mut failures = self.failures();
        match failures.get(address) {
            Some(failed_at) if failed_at.elapsed() < backoff => true,
            Some(_) => {
                failures.remove(address);
                false
            }
            None => false,
        }
    }

    /// Links with every broker the directory lists that is not linked yet.
    /// Brokers that recently failed to answer a dial are skipped.
    pub async fn refresh_peers(self: &Arc<Self>) {
        let Some(directory) = &self.directory else {
            return;
        };
        if self.is_stopping() {
            return;
        }
        let brokers = match directory.get_active_brokers().await {
            Ok(brokers) => brokers,
            Err(e) => {
                warn!(error = %e, "failed to query directory");
                return;
            }
        };
        for address in brokers {
            if address == self.address || self.peers.contains(&address) {
                continue;
            }
            if self.is_backing_off(&address) {
                debug!(peer = %address, "skipping broker, recent dial failed");
                continue;
            }
            if let Err(e) = self.connect_to_peer(&address).await {
                warn!(peer = %address, error = %e, "failed to connect to broker");
            }
        }
    }

    fn spawn_discovery(self: &Arc<Self>) {
        if self.directory.is_none() {
            return;
        }
        let period = Duration::from_secs(self.settings.directory.refresh_interval_secs.max(1));
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                if node.is_stopping() {
                    break;
                }
                node.refresh_peers().await;
            }
        });
    }
}

fn ensure_owner(registry: &Registry, topic_id: &str, caller: &str) -> Result<()> {
    if !registry.exists(topic_id) {
        return Err(BrokerError::TopicNotFound(topic_id.to_string()));
    }
    if !registry.is_owner(topic_id, caller) {
        return Err(BrokerError::NotOwner {
            topic_id: topic_id.to_string(),
            user: caller.to_string(),
        });
    }
    Ok(())
}

impl PeerHandler for BrokerNode {
    fn on_message(&self, link: &Arc<PeerLink>, msg: PeerMessage) {
        let origin = Origin::Peer(link.address().to_string());
        let applied = match msg {
            PeerMessage::SyncTopic {
                topic_id,
                name,
                owner,
            } => self
                .registry()
                .create_topic(&owner, &topic_id, &name, &origin),
            PeerMessage::SyncMessage { topic_id, message } => {
                self.registry().publish(&topic_id, &message, &origin)
            }
            PeerMessage::SyncSub {
                topic_id,
                subscriber,
            } => self.registry().subscribe(&topic_id, &subscriber, &origin),
            PeerMessage::SyncUnsub {
                topic_id,
                subscriber,
            } => self
                .registry()
                .unsubscribe(&topic_id, &subscriber, &origin),
            PeerMessage::SyncDelete { topic_id } => self.registry().delete_topic(&topic_id, &origin),
            PeerMessage::RequestLock => {
                link.grant_remote_lock(self.admission.lock_handle());
                Ok(None)
            }
            PeerMessage::ReleaseLock => {
                link.release_remote_lock();
                Ok(None)
            }
            PeerMessage::GetLocalSubscriberCount => link
                .send(&PeerMessage::SubscriberCount(self.local_count(Role::Subscriber)))
                .map(|_| None),
            PeerMessage::GetLocalPublisherCount => link
                .send(&PeerMessage::PublisherCount(self.local_count(Role::Publisher)))
                .map(|_| None),
            reply => Err(BrokerError::Protocol(format!("unexpected reply {reply}"))),
        };

        match applied {
            Ok(None) => {}
            Ok(Some(flood)) => {
                // replicated commands never produce a flood; guard against loops anyway
                warn!(command = %flood, "dropping re-flood of replicated command");
            }
            Err(e) => debug!(peer = %link.address(), error = %e, "replicated command not applied"),
        }
    }

    fn on_closed(&self, link: &Arc<PeerLink>) {
        if self.peers.remove(link) {
            info!(peer = %link.address(), "broker link removed");
        }
    }
}
