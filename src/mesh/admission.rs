//! Mesh-wide admission control
//!
//! Before a publisher or subscriber is admitted, the accepting broker takes
//! the admission lock of every broker it is linked to (its own included),
//! sums their active connection counts for the role, and admits only if the
//! total is below the configured mesh-wide limit. Only one admission decision
//! involving a given broker can be in progress at a time.
//!
//! Locks are taken in address order across all participants, so two brokers
//! admitting concurrently cannot each hold a lock the other is waiting for.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::client::{Client, Role};
use crate::config::BrokerSettings;
use crate::mesh::node::BrokerNode;
use crate::mesh::peer::PeerLink;
use crate::transport::message::PeerMessage;
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct AdmissionController {
    lock: Arc<Mutex<()>>,
    /// Serializes this node's own admissions, so each link carries at most
    /// one outstanding `request_lock`.
    turn: Mutex<()>,
    timeout: Duration,
    pub_limit: usize,
    sub_limit: usize,
}

/// Locks held for one admission decision. Dropping it sends `release_lock`
/// to every peer that was asked for its lock and frees the local one.
struct MeshLock {
    _local: Option<OwnedMutexGuard<()>>,
    peers: Vec<Arc<PeerLink>>,
}

impl Drop for MeshLock {
    fn drop(&mut self) {
        for link in &self.peers {
            // a failed link has already dropped its socket, freeing the peer's lock
            if link.is_closed() {
                continue;
            }
            if let Err(e) = link.send(&PeerMessage::ReleaseLock) {
                warn!(peer = %link.address(), error = %e, "failed to release peer lock");
            }
        }
    }
}

impl AdmissionController {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            turn: Mutex::new(()),
            timeout: Duration::from_millis(settings.admission_timeout_ms),
            pub_limit: settings.total_pub_limit,
            sub_limit: settings.total_sub_limit,
        }
    }

    /// The mutex guarding this broker's admission state; peers acquire it
    /// through `request_lock`.
    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }

    pub fn limit_for(&self, role: Role) -> Option<usize> {
        match role {
            Role::Publisher => Some(self.pub_limit),
            Role::Subscriber => Some(self.sub_limit),
            Role::Broker => None,
        }
    }

    /// Runs the admission protocol for `client` and registers it with the
    /// node's registry if the mesh has room for its role.
    pub async fn admit(&self, node: &BrokerNode, client: Client) -> Result<()> {
        let role = client.role;
        let limit = self.limit_for(role).ok_or_else(|| {
            BrokerError::HandshakeRejected("brokers are not subject to admission".to_string())
        })?;

        let _turn = tokio::time::timeout(self.timeout, self.turn.lock())
            .await
            .map_err(|_| BrokerError::AdmissionTimeout("pending local admission".to_string()))?;

        let peers = node.peers().snapshot();
        let mesh_lock = self.lock_mesh(node.address(), &peers).await?;

        let total = self.count(node, role, &peers).await?;
        if total >= limit {
            info!(user = %client.username, %role, total, limit, "admission denied, mesh at capacity");
            return Err(BrokerError::AdmissionDenied {
                role: role.to_string(),
                count: total,
                limit,
            });
        }

        info!(user = %client.username, %role, total, limit, "client admitted");
        node.registry().register_client(client);
        drop(mesh_lock);
        Ok(())
    }

    async fn lock_mesh(&self, own_address: &str, peers: &[Arc<PeerLink>]) -> Result<MeshLock> {
        let mut held = MeshLock {
            _local: None,
            peers: Vec::with_capacity(peers.len()),
        };

        let mut local_taken = false;
        for link in peers {
            if !local_taken && own_address < link.address() {
                held._local = Some(self.lock_local().await?);
                local_taken = true;
            }
            // from here on a release is owed, even if the ack never comes
            held.peers.push(Arc::clone(link));
            match link
                .request(PeerMessage::RequestLock, self.timeout)
                .await?
            {
                PeerMessage::LockAck => debug!(peer = %link.address(), "peer lock acquired"),
                other => {
                    warn!(peer = %link.address(), reply = %other, "unexpected reply to lock request");
                    return Err(BrokerError::LockDenied(link.address().to_string()));
                }
            }
        }
        if !local_taken {
            held._local = Some(self.lock_local().await?);
        }
        Ok(held)
    }

    async fn lock_local(&self) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(self.timeout, Arc::clone(&self.lock).lock_owned())
            .await
            .map_err(|_| BrokerError::AdmissionTimeout("local admission lock".to_string()))
    }

    /// Mesh-wide number of active connections with `role`.
    async fn count(&self, node: &BrokerNode, role: Role, peers: &[Arc<PeerLink>]) -> Result<usize> {
        let query = match role {
            Role::Publisher => PeerMessage::GetLocalPublisherCount,
            _ => PeerMessage::GetLocalSubscriberCount,
        };
        let replies = join_all(
            peers
                .iter()
                .map(|link| link.request(query.clone(), self.timeout)),
        )
        .await;

        let mut total = node.local_count(role);
        for (link, reply) in peers.iter().zip(replies) {
            match reply {
                Ok(PeerMessage::PublisherCount(n)) | Ok(PeerMessage::SubscriberCount(n)) => {
                    debug!(peer = %link.address(), count = n, %role, "peer count");
                    total += n;
                }
                Ok(other) => {
                    return Err(BrokerError::Protocol(format!(
                        "unexpected count reply from {}: {other}",
                        link.address()
                    )));
                }
                Err(BrokerError::AdmissionTimeout(peer)) => {
                    return Err(BrokerError::AdmissionTimeout(peer));
                }
                Err(e) => {
                    warn!(peer = %link.address(), error = %e, "count query failed");
                    return Err(BrokerError::PeerUnreachable(link.address().to_string()));
                }
            }
        }
        Ok(total)
    }
}
