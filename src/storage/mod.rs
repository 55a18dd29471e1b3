//! Local datastore for verified items
//!
//! Maps item keys to validated `SignedItem`s plus the bookkeeping the
//! republication, expiry, and cache-pruning passes need. Callers must
//! validate items cryptographically before insertion; the store only
//! arbitrates replacement precedence.

use std::collections::HashMap;

use tracing::debug;

use crate::crypto::item::SignedItem;
use crate::protocol::NodeId;

/// Where an inserted item came from. Network receipts feed the
/// "republished to us recently" suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrigin {
    /// Built and published by this node
    Local,
    /// Received in a `STORE` from a peer
    Network,
}

/// Outcome of a store attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First item under this key
    Inserted,
    /// Superseded an older item
    Replaced,
    /// Same item again; receipt bookkeeping updated
    Refreshed,
    /// Older than what is held; dropped silently
    IgnoredOlder,
}

#[derive(Debug, Clone)]
struct Entry {
    item: SignedItem,
    last_requested: u64,
    last_republished: u64,
    /// Last time a network STORE delivered this item (0 for local-only).
    last_received: u64,
}

/// In-memory item store
#[derive(Debug, Default)]
pub struct Datastore {
    entries: HashMap<NodeId, Entry>,
}

impl Datastore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace under the item's key. `now` is the engine's
    /// monotonic clock; precedence between items uses their own signed
    /// timestamps, never arrival order.
    pub fn store(&mut self, item: SignedItem, now: u64, origin: StoreOrigin) -> StoreOutcome {
        let received = match origin {
            StoreOrigin::Network => now,
            StoreOrigin::Local => 0,
        };
        match self.entries.get_mut(&item.key) {
            None => {
                debug!(key = %item.key.short_hex(), "storing new item");
                self.entries.insert(
                    item.key,
                    Entry {
                        item,
                        last_requested: now,
                        last_republished: now,
                        last_received: received,
                    },
                );
                StoreOutcome::Inserted
            }
            Some(entry) => {
                if item.supersedes(&entry.item) {
                    debug!(key = %item.key.short_hex(), "replacing item with newer version");
                    entry.item = item;
                    entry.last_republished = now;
                    if origin == StoreOrigin::Network {
                        entry.last_received = now;
                    }
                    StoreOutcome::Replaced
                } else if entry.item.timestamp == item.timestamp && entry.item.sig == item.sig {
                    if origin == StoreOrigin::Network {
                        entry.last_received = now;
                    }
                    StoreOutcome::Refreshed
                } else {
                    StoreOutcome::IgnoredOlder
                }
            }
        }
    }

    /// Fetch an item, recording the request for retention decisions.
    pub fn get(&mut self, key: &NodeId, now: u64) -> Option<&SignedItem> {
        let entry = self.entries.get_mut(key)?;
        entry.last_requested = now;
        Some(&entry.item)
    }

    /// Fetch without touching bookkeeping.
    pub fn peek(&self, key: &NodeId) -> Option<&SignedItem> {
        self.entries.get(key).map(|e| &e.item)
    }

    pub fn contains(&self, key: &NodeId) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &NodeId) -> Option<SignedItem> {
        self.entries.remove(key).map(|e| e.item)
    }

    /// Delete every item whose expiry has passed. Returns the count.
    pub fn expire_scan(&mut self, now_wall: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.item.expires == 0 || e.item.expires >= now_wall);
        before - self.entries.len()
    }

    /// Keys due for republication: held longer than `interval` since the
    /// last republish, and not refreshed by a network STORE within the
    /// current cycle.
    pub fn republish_due(&self, now: u64, interval: u64) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, e)| {
                now.saturating_sub(e.last_republished) >= interval
                    && (e.last_received == 0 || now.saturating_sub(e.last_received) >= interval)
            })
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn mark_republished(&mut self, key: &NodeId, now: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_republished = now;
        }
    }

    /// Drop caching copies: items unrequested for a full cycle whose keys
    /// the caller judges far from this node. Returns the dropped keys.
    pub fn prune_cached<F>(&mut self, now: u64, interval: u64, is_far: F) -> Vec<NodeId>
    where
        F: Fn(&NodeId) -> bool,
    {
        let victims: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(k, e)| now.saturating_sub(e.last_requested) >= interval && is_far(k))
            .map(|(k, _)| *k)
            .collect();
        for key in &victims {
            debug!(key = %key.short_hex(), "dropping distant cached item");
            self.entries.remove(key);
        }
        victims
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    #[cfg(test)]
    fn entry(&self, key: &NodeId) -> Option<&Entry> {
        self.entries.get(key)
    }
}
