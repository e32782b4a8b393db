use std::collections::HashSet;

pub type TopicId = String;
pub type SubscriberId = String;

/// A named channel with exactly one owning publisher.
///
/// `owner` is fixed at creation; `subscribers` holds usernames from every
/// broker in the mesh, not only local ones.
#[derive(Debug, Clone)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub owner: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    pub fn new(id: &str, name: &str, owner: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Adds a subscriber. Returns `false` if it was already present.
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.insert(id)
    }

    /// Removes a subscriber. Returns `false` if it was not present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.subscribers.contains(id)
    }
}

/// One row of `list_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    pub id: TopicId,
    pub name: String,
    pub owner: String,
}
