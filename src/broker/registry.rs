//! Topic/subscription registry
//!
//! Holds every topic known to this broker (locally created or replicated),
//! its owner and its mesh-wide subscriber set, plus the active local client
//! connections that messages are delivered to.
//!
//! Every mutating operation takes an `Origin`. A `Local` mutation returns the
//! `PeerMessage` the caller must flood to all peers; a mutation applied from a
//! peer returns `None` so replicated commands are never re-flooded.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::broker::topic::{SubscriberId, Topic, TopicId, TopicSummary};
use crate::client::{Client, ConnectionId, Role};
use crate::transport::message::PeerMessage;
use crate::utils::error::{BrokerError, Result};

/// Where a mutation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A client connected to this broker.
    Local,
    /// A replication command received from the peer at this address.
    Peer(String),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    fn replicate(&self, msg: impl FnOnce() -> PeerMessage) -> Option<PeerMessage> {
        self.is_local().then(msg)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    pub(crate) topics: HashMap<TopicId, Topic>,
    pub(crate) clients: HashMap<ConnectionId, Client>,
    /// Replicated subscriptions that arrived before their topic.
    orphans: HashMap<TopicId, HashSet<SubscriberId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&mut self, client: Client) {
        debug!(connection = %client.id, user = %client.username, role = %client.role, "client registered");
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<Client> {
        self.clients.remove(client_id)
    }

    /// Number of active local connections with the given role.
    pub fn local_count(&self, role: Role) -> usize {
        self.clients.values().filter(|c| c.role == role).count()
    }

    /// Whether any active local connection uses this identity and role.
    pub fn has_connection(&self, username: &str, role: Role) -> bool {
        self.clients
            .values()
            .any(|c| c.role == role && c.username == username)
    }

    /// Creates a topic. The existence check and the insert happen under the
    /// same borrow, so two local creates of one id cannot both succeed.
    ///
    /// A replicated create of an id that already exists is ignored.
    pub fn create_topic(
        &mut self,
        owner: &str,
        topic_id: &str,
        name: &str,
        origin: &Origin,
    ) -> Result<Option<PeerMessage>> {
        match self.topics.entry(topic_id.to_string()) {
            Entry::Occupied(existing) => {
                if origin.is_local() {
                    return Err(BrokerError::TopicExists(topic_id.to_string()));
                }
                debug!(
                    topic = topic_id,
                    owner = %existing.get().owner,
                    "replicated topic already present"
                );
                Ok(None)
            }
            Entry::Vacant(slot) => {
                let mut topic = Topic::new(topic_id, name, owner);
                if let Some(early) = self.orphans.remove(topic_id) {
                    topic.subscribers.extend(early);
                }
                slot.insert(topic);
                info!(topic = topic_id, name, owner, ?origin, "topic created");
                Ok(origin.replicate(|| PeerMessage::SyncTopic {
                    topic_id: topic_id.to_string(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                }))
            }
        }
    }

    /// Removes a topic with its subscriber set and tells every local
    /// subscriber of it that it is gone.
    pub fn delete_topic(&mut self, topic_id: &str, origin: &Origin) -> Result<Option<PeerMessage>> {
        self.orphans.remove(topic_id);
        let topic = self
            .topics
            .remove(topic_id)
            .ok_or_else(|| BrokerError::TopicNotFound(topic_id.to_string()))?;

        let notice = format!("Topic {} ({}) has been deleted.", topic.id, topic.name);
        for client in self.local_subscribers(&topic) {
            if !client.send_line(notice.clone()) {
                warn!(user = %client.username, topic = topic_id, "failed to notify subscriber of deletion");
            }
        }

        info!(topic = topic_id, ?origin, "topic deleted");
        Ok(origin.replicate(|| PeerMessage::SyncDelete {
            topic_id: topic_id.to_string(),
        }))
    }

    /// Delivers `message` to every local connection subscribed to the topic.
    pub fn publish(&self, topic_id: &str, message: &str, origin: &Origin) -> Result<Option<PeerMessage>> {
        let topic = self
            .topics
            .get(topic_id)
            .ok_or_else(|| BrokerError::TopicNotFound(topic_id.to_string()))?;

        let line = format!("{}:{}: Message Received: {}", topic.id, topic.name, message);
        let mut delivered = 0usize;
        for client in self.local_subscribers(topic) {
            if client.send_line(line.clone()) {
                delivered += 1;
            } else {
                warn!(user = %client.username, topic = topic_id, "failed to deliver message");
            }
        }

        debug!(topic = topic_id, delivered, ?origin, "message published");
        Ok(origin.replicate(|| PeerMessage::SyncMessage {
            topic_id: topic_id.to_string(),
            message: message.to_string(),
        }))
    }

    /// Adds a subscription. Subscribing twice is a no-op and is not
    /// replicated again.
    pub fn subscribe(
        &mut self,
        topic_id: &str,
        subscriber: &str,
        origin: &Origin,
    ) -> Result<Option<PeerMessage>> {
        match self.topics.get_mut(topic_id) {
            Some(topic) => {
                if !topic.subscribe(subscriber.to_string()) {
                    return Ok(None);
                }
            }
            None if origin.is_local() => {
                return Err(BrokerError::TopicNotFound(topic_id.to_string()));
            }
            None => {
                debug!(topic = topic_id, subscriber, "holding subscription for unknown topic");
                self.orphans
                    .entry(topic_id.to_string())
                    .or_default()
                    .insert(subscriber.to_string());
                return Ok(None);
            }
        }

        info!(topic = topic_id, subscriber, ?origin, "subscribed");
        Ok(origin.replicate(|| PeerMessage::SyncSub {
            topic_id: topic_id.to_string(),
            subscriber: subscriber.to_string(),
        }))
    }

    pub fn unsubscribe(
        &mut self,
        topic_id: &str,
        subscriber: &str,
        origin: &Origin,
    ) -> Result<Option<PeerMessage>> {
        let removed = match self.topics.get_mut(topic_id) {
            Some(topic) => topic.unsubscribe(subscriber),
            None => self
                .orphans
                .get_mut(topic_id)
                .is_some_and(|early| early.remove(subscriber)),
        };
        if !removed {
            return Err(BrokerError::NotSubscribed {
                topic_id: topic_id.to_string(),
                subscriber: subscriber.to_string(),
            });
        }

        info!(topic = topic_id, subscriber, ?origin, "unsubscribed");
        Ok(origin.replicate(|| PeerMessage::SyncUnsub {
            topic_id: topic_id.to_string(),
            subscriber: subscriber.to_string(),
        }))
    }

    pub fn exists(&self, topic_id: &str) -> bool {
        self.topics.contains_key(topic_id)
    }

    pub fn is_owner(&self, topic_id: &str, who: &str) -> bool {
        self.topics.get(topic_id).is_some_and(|t| t.owner == who)
    }

    pub fn is_subscribed(&self, topic_id: &str, who: &str) -> bool {
        self.topics
            .get(topic_id)
            .is_some_and(|t| t.is_subscribed(who))
    }

    pub fn subscriber_count(&self, topic_id: &str) -> Result<usize> {
        self.topics
            .get(topic_id)
            .map(|t| t.subscribers.len())
            .ok_or_else(|| BrokerError::TopicNotFound(topic_id.to_string()))
    }

    /// All topics, ordered by id.
    pub fn list_topics(&self) -> Vec<TopicSummary> {
        let mut topics: Vec<TopicSummary> = self
            .topics
            .values()
            .map(|t| TopicSummary {
                id: t.id.clone(),
                name: t.name.clone(),
                owner: t.owner.clone(),
            })
            .collect();
        topics.sort_by(|a, b| a.id.cmp(&b.id));
        topics
    }

    /// `(topic id, topic name)` for every topic `subscriber` belongs to.
    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<(TopicId, String)> {
        let mut subs: Vec<(TopicId, String)> = self
            .topics
            .values()
            .filter(|t| t.is_subscribed(subscriber))
            .map(|t| (t.id.clone(), t.name.clone()))
            .collect();
        subs.sort();
        subs
    }

    pub fn topics_owned_by(&self, owner: &str) -> Vec<TopicId> {
        let mut owned: Vec<TopicId> = self
            .topics
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.id.clone())
            .collect();
        owned.sort();
        owned
    }

    fn local_subscribers<'a>(&'a self, topic: &'a Topic) -> impl Iterator<Item = &'a Client> + 'a {
        self.clients
            .values()
            .filter(move |c| c.role == Role::Subscriber && topic.is_subscribed(&c.username))
    }
}
