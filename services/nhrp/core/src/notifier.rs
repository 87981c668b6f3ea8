//! Subscriber lists and removal-safe event fan-out.
//!
//! Every entity that others watch owns a [`NotifierList`] of subscriber
//! keys. Subscribers are not callbacks: they are plain keys resolved by the
//! context that owns all entities, which receives each delivery through
//! [`Observer::on_event`]. This lets handlers freely mutate any table,
//! including unsubscribing themselves or others in the middle of a round.

use smallvec::SmallVec;

/// Ordered set of subscriber keys attached to one owner
#[derive(Debug, Clone)]
pub struct NotifierList<K> {
    subscribers: SmallVec<[K; 4]>,
}

impl<K> Default for NotifierList<K> {
    fn default() -> Self {
        Self {
            subscribers: SmallVec::new(),
        }
    }
}

impl<K: Copy + PartialEq> NotifierList<K> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber; subscribing twice is a no-op
    pub fn subscribe(&mut self, key: K) {
        if !self.contains(&key) {
            self.subscribers.push(key);
        }
    }

    /// Remove a subscriber; removing an absent key is a no-op
    pub fn unsubscribe(&mut self, key: &K) -> bool {
        match self.subscribers.iter().position(|k| k == key) {
            Some(pos) => {
                self.subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether `key` is subscribed
    pub fn contains(&self, key: &K) -> bool {
        self.subscribers.contains(key)
    }

    /// Whether anyone is subscribed
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Copy of the current subscribers in registration order
    pub fn snapshot(&self) -> SmallVec<[K; 4]> {
        self.subscribers.clone()
    }

    /// Drop every subscriber
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

/// Context that owns notifier lists and receives deliveries
pub trait Observer<K, E> {
    /// Identifies the entity owning a list
    type Owner: Copy;

    /// Look up an owner's list; `None` once the owner is gone
    fn notifier(&self, owner: Self::Owner) -> Option<&NotifierList<K>>;

    /// Deliver one event to one subscriber
    fn on_event(&mut self, owner: Self::Owner, subscriber: K, event: E);
}

/// Deliver `event` to every subscriber of `owner`
///
/// The round walks a snapshot taken on entry. A subscriber removed by an
/// earlier delivery is skipped; one added during the round is first
/// delivered on the next round. The round ends early if the owner itself
/// disappears.
pub fn announce<C, K, E>(ctx: &mut C, owner: C::Owner, event: E)
where
    C: Observer<K, E>,
    K: Copy + PartialEq,
    E: Copy,
{
    let snapshot = match ctx.notifier(owner) {
        Some(list) => list.snapshot(),
        None => return,
    };
    for subscriber in snapshot {
        match ctx.notifier(owner) {
            Some(list) if list.contains(&subscriber) => {}
            Some(_) => continue,
            None => return,
        }
        ctx.on_event(owner, subscriber, event);
    }
}
