//! Peer links
//!
//! A `PeerLink` is one socket to one peer broker, used in both directions:
//! - outbound: replication commands and admission requests are queued onto
//!   an unbounded channel drained by a writer task, so flooding never waits
//!   on the network;
//! - inbound: a reader task parses each line and either hands it to the
//!   `PeerHandler` (replication, lock and count commands) or completes the
//!   local request waiting for that reply.
//!
//! The wire protocol carries no correlation ids. Replies of one kind come
//! back in request order, so waiters are kept in a FIFO per `ResponseKind`.
//! A request that times out poisons that order, so the link is failed on
//! the spot: the peer sees EOF, drops any lock it granted us, and the two
//! brokers relink with fresh state on the next discovery pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, OwnedMutexGuard, oneshot};
use tracing::{debug, info, warn};

use crate::transport::lines::spawn_line_writer;
use crate::transport::message::{PeerMessage, ResponseKind};
use crate::utils::error::{BrokerError, Result};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Receives the non-reply traffic of a peer link.
pub trait PeerHandler: Send + Sync + 'static {
    /// A replication or control command sent by the peer, in arrival order.
    fn on_message(&self, link: &Arc<PeerLink>, msg: PeerMessage);

    /// The link is gone; pending requests have already failed.
    fn on_closed(&self, link: &Arc<PeerLink>);
}

/// State of the admission lock this broker holds on behalf of the peer.
enum RemoteLock {
    Idle,
    /// Waiting for the local admission mutex; the number identifies the
    /// request so a `release_lock` can cancel it.
    Pending(u64),
    Held { _guard: OwnedMutexGuard<()> },
}

type Waiters = HashMap<ResponseKind, VecDeque<(u64, oneshot::Sender<PeerMessage>)>>;

pub struct PeerLink {
    id: u64,
    address: String,
    /// Taken on shutdown so the writer task drains and closes the socket.
    outbound: Mutex<Option<UnboundedSender<String>>>,
    pending: Mutex<Waiters>,
    next_ticket: AtomicU64,
    remote_lock: Mutex<RemoteLock>,
    closed: AtomicBool,
    close_signal: Arc<Notify>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerLink {
    /// Creates a link that is not yet attached to a socket. Lines sent
    /// before `run` are buffered and written first.
    pub fn new(address: impl Into<String>) -> (Arc<Self>, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            outbound: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            remote_lock: Mutex::new(RemoteLock::Idle),
            closed: AtomicBool::new(false),
            close_signal: Arc::new(Notify::new()),
        });
        (link, rx)
    }

    /// Attaches the link to its socket halves and starts the reader and
    /// writer tasks.
    pub fn run<R, W, H>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
        outbound: UnboundedReceiver<String>,
        handler: Arc<H>,
    ) where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        H: PeerHandler,
    {
        let signal = Arc::clone(&self.close_signal);
        spawn_line_writer(writer, outbound, format!("peer {}", self.address), move || {
            signal.notify_one();
        });

        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.read_loop(reader, handler.as_ref()).await;
            link.shutdown();
            handler.on_closed(&link);
        });
    }

    async fn read_loop<R, H>(self: &Arc<Self>, reader: R, handler: &H)
    where
        R: AsyncBufRead + Unpin,
        H: PeerHandler,
    {
        let mut lines = reader.lines();
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = self.close_signal.notified() => {
                    debug!(peer = %self.address, "link closed locally");
                    return;
                }
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!(peer = %self.address, "peer disconnected");
                    return;
                }
                Err(e) => {
                    warn!(peer = %self.address, error = %e, "peer disconnected abruptly");
                    return;
                }
            };

            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            debug!(peer = %self.address, %line, "received");

            match PeerMessage::parse(line) {
                Ok(msg) if msg.response_kind().is_some() => {
                    if !self.resolve(msg) {
                        debug!(peer = %self.address, %line, "reply with no waiting request dropped");
                    }
                }
                Ok(msg) => handler.on_message(self, msg),
                Err(e) => warn!(peer = %self.address, error = %e, "ignoring malformed peer line"),
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues a message for the peer.
    pub fn send(&self, msg: &PeerMessage) -> Result<()> {
        self.send_line(msg.to_string())
    }

    pub fn send_line(&self, line: impl Into<String>) -> Result<()> {
        let unreachable = || BrokerError::PeerUnreachable(self.address.clone());
        if self.is_closed() {
            return Err(unreachable());
        }
        match locked(&self.outbound).as_ref() {
            Some(outbound) => outbound.send(line.into()).map_err(|_| unreachable()),
            None => Err(unreachable()),
        }
    }

    /// Sends a request and waits for its correlated reply.
    ///
    /// Expiry of `timeout` yields `AdmissionTimeout` and fails the link, so
    /// a late reply can never be matched to a later request. A link that
    /// closes while waiting yields `PeerUnreachable`.
    pub async fn request(&self, msg: PeerMessage, timeout: Duration) -> Result<PeerMessage> {
        let kind = msg
            .expected_response()
            .ok_or_else(|| BrokerError::Protocol(format!("{msg} expects no reply")))?;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        locked(&self.pending)
            .entry(kind)
            .or_default()
            .push_back((ticket, tx));

        if let Err(e) = self.send(&msg) {
            self.forget(kind, ticket);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BrokerError::PeerUnreachable(self.address.clone())),
            Err(_) => {
                self.forget(kind, ticket);
                warn!(peer = %self.address, request = %msg, "request timed out, dropping link");
                self.fail();
                Err(BrokerError::AdmissionTimeout(self.address.clone()))
            }
        }
    }

    fn forget(&self, kind: ResponseKind, ticket: u64) {
        if let Some(queue) = locked(&self.pending).get_mut(&kind) {
            queue.retain(|(t, _)| *t != ticket);
        }
    }

    /// Hands a reply to the oldest request of its kind.
    fn resolve(&self, msg: PeerMessage) -> bool {
        let Some(kind) = msg.response_kind() else {
            return false;
        };
        if self.is_closed() {
            return false;
        }
        let waiter = locked(&self.pending)
            .get_mut(&kind)
            .and_then(|queue| queue.pop_front());
        match waiter {
            Some((_, tx)) => {
                let _ = tx.send(msg);
                true
            }
            None => false,
        }
    }

    /// Grants this peer the local admission lock once it is free, then
    /// answers `lock_ack`. Runs in its own task so the reader keeps applying
    /// replication traffic meanwhile.
    pub fn grant_remote_lock(self: &Arc<Self>, lock: Arc<tokio::sync::Mutex<()>>) {
        let request = {
            let mut slot = locked(&self.remote_lock);
            if matches!(*slot, RemoteLock::Pending(_)) {
                return;
            }
            if matches!(*slot, RemoteLock::Held { .. }) {
                None
            } else {
                let request = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                *slot = RemoteLock::Pending(request);
                Some(request)
            }
        };
        let Some(request) = request else {
            // a repeated request while already held
            if let Err(e) = self.send(&PeerMessage::LockAck) {
                warn!(peer = %self.address, error = %e, "failed to re-acknowledge lock");
            }
            return;
        };

        let link = Arc::clone(self);
        tokio::spawn(async move {
            let guard = lock.lock_owned().await;
            let granted = {
                let mut slot = locked(&link.remote_lock);
                let still_wanted =
                    matches!(*slot, RemoteLock::Pending(r) if r == request) && !link.is_closed();
                if still_wanted {
                    *slot = RemoteLock::Held { _guard: guard };
                }
                still_wanted
            };
            if granted {
                debug!(peer = %link.address, "admission lock granted to peer");
                if let Err(e) = link.send(&PeerMessage::LockAck) {
                    warn!(peer = %link.address, error = %e, "failed to acknowledge lock");
                    link.release_remote_lock();
                }
            }
        });
    }

    /// Releases the lock held for this peer, or cancels a pending grant.
    pub fn release_remote_lock(&self) {
        let previous = std::mem::replace(&mut *locked(&self.remote_lock), RemoteLock::Idle);
        if matches!(previous, RemoteLock::Held { .. }) {
            debug!(peer = %self.address, "admission lock released by peer");
        }
    }

    pub fn holds_remote_lock(&self) -> bool {
        matches!(*locked(&self.remote_lock), RemoteLock::Held { .. })
    }

    /// Asks the reader task to stop; the link then shuts down and is
    /// reported through `PeerHandler::on_closed`.
    pub fn close(&self) {
        self.close_signal.notify_one();
    }

    /// Stops all traffic at once: nothing more is sent or resolved, and
    /// the reader task is told to stop.
    fn fail(&self) {
        self.closed.store(true, Ordering::SeqCst);
        locked(&self.pending).clear();
        self.close();
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders fails every pending request
        locked(&self.pending).clear();
        self.release_remote_lock();
        locked(&self.outbound).take();
    }
}

#[derive(Default)]
struct PeerSetInner {
    links: HashMap<String, Arc<PeerLink>>,
    dialing: HashSet<String>,
}

/// The directly connected peers of one broker, at most one link per address.
#[derive(Default)]
pub struct PeerSet {
    inner: Mutex<PeerSetInner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        locked(&self.inner).links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &str) -> bool {
        locked(&self.inner).links.contains_key(address)
    }

    /// Open links ordered by address.
    pub fn snapshot(&self) -> Vec<Arc<PeerLink>> {
        let mut links: Vec<Arc<PeerLink>> = locked(&self.inner)
            .links
            .values()
            .filter(|link| !link.is_closed())
            .cloned()
            .collect();
        links.sort_by(|a, b| a.address.cmp(&b.address));
        links
    }

    /// Marks an outbound dial as in flight. Returns `false` when the address
    /// is already linked or being dialed.
    pub fn begin_dial(&self, address: &str) -> bool {
        let mut inner = locked(&self.inner);
        if inner.links.contains_key(address) || inner.dialing.contains(address) {
            return false;
        }
        inner.dialing.insert(address.to_string())
    }

    /// Ends an outbound dial, registering `link` unless a link to the same
    /// address appeared meanwhile. Returns whether `link` was registered.
    pub fn finish_dial(&self, address: &str, link: Option<Arc<PeerLink>>) -> bool {
        let mut inner = locked(&self.inner);
        inner.dialing.remove(address);
        match link {
            Some(link) if !inner.links.contains_key(address) => {
                inner.links.insert(address.to_string(), link);
                true
            }
            _ => false,
        }
    }

    /// Registers a link a peer opened to us.
    ///
    /// When both brokers dial each other at once, the connection opened by
    /// the lower address is kept on both sides.
    pub fn accept_inbound(&self, own_address: &str, link: Arc<PeerLink>) -> bool {
        let mut inner = locked(&self.inner);
        let address = link.address.clone();
        if address == own_address || inner.links.contains_key(&address) {
            return false;
        }
        if inner.dialing.contains(&address) && own_address < address.as_str() {
            return false;
        }
        inner.links.insert(address, link);
        true
    }

    /// Removes `link` if it is still the registered link for its address.
    pub fn remove(&self, link: &Arc<PeerLink>) -> bool {
        let mut inner = locked(&self.inner);
        match inner.links.get(&link.address) {
            Some(current) if Arc::ptr_eq(current, link) => {
                inner.links.remove(&link.address);
                true
            }
            _ => false,
        }
    }

    /// Queues `msg` for every peer. A peer that cannot take it is skipped;
    /// delivery to it is not retried.
    pub fn flood(&self, msg: &PeerMessage) -> usize {
        let links = self.snapshot();
        let mut sent = 0;
        for link in links {
            match link.send(msg) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %link.address, error = %e, command = %msg, "flood skipped peer"),
            }
        }
        sent
    }
}
