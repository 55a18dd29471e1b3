//! K-buckets: bounded contact lists over contiguous keyspace ranges
//!
//! A bucket covers the set of identifiers sharing its prefix. Contacts are
//! kept oldest-first; refreshing a known contact moves it to the tail. A
//! FIFO replacement cache holds fresh candidates that arrived while the
//! bucket was full and unsplittable.

use std::collections::VecDeque;

use rand::RngCore;

use crate::protocol::{Distance, NodeId, ID_BITS};
use crate::routing::Contact;

/// Outcome of a bucket insertion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketInsert {
    /// New contact appended
    Added,
    /// Contact was already present; moved to tail and touched
    Refreshed,
    /// Bucket at capacity
    Full,
}

/// Capacity-K contact list covering the keyspace range that shares
/// `prefix`'s first `depth` bits.
#[derive(Debug, Clone)]
pub struct KBucket {
    prefix: NodeId,
    depth: usize,
    capacity: usize,
    contacts: Vec<Contact>,
    cache: VecDeque<Contact>,
    pub last_refreshed: u64,
}

impl KBucket {
    pub fn new(prefix: NodeId, depth: usize, capacity: usize, now: u64) -> Self {
        Self {
            prefix,
            depth,
            capacity,
            contacts: Vec::with_capacity(capacity),
            cache: VecDeque::with_capacity(capacity),
            last_refreshed: now,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn prefix(&self) -> &NodeId {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Whether `id` falls inside this bucket's range.
    pub fn covers(&self, id: &NodeId) -> bool {
        id.matches_prefix(&self.prefix, self.depth)
    }

    /// Oldest contact (next liveness-probe victim when the bucket is full).
    pub fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Youngest contact.
    pub fn tail(&self) -> Option<&Contact> {
        self.contacts.last()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id == *id)
    }

    /// Add or refresh a contact.
    pub fn insert(&mut self, contact: Contact, now: u64) -> BucketInsert {
        debug_assert!(self.covers(&contact.id));
        if let Some(idx) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self.contacts.remove(idx);
            existing.touch(now);
            existing.address = contact.address;
            existing.version = contact.version;
            self.contacts.push(existing);
            return BucketInsert::Refreshed;
        }
        if self.contacts.len() < self.capacity {
            self.contacts.push(contact);
            return BucketInsert::Added;
        }
        BucketInsert::Full
    }

    /// Move a known contact to the tail; false when absent.
    pub fn touch(&mut self, id: &NodeId, now: u64) -> bool {
        if let Some(idx) = self.contacts.iter().position(|c| c.id == *id) {
            let mut existing = self.contacts.remove(idx);
            existing.touch(now);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    /// Drop and return a contact.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.contacts.iter().position(|c| c.id == *id)?;
        Some(self.contacts.remove(idx))
    }

    /// Up to `n` contacts ordered by XOR distance to `target`.
    pub fn nearest_to(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut contacts: Vec<(Distance, Contact)> = self
            .contacts
            .iter()
            .map(|c| (c.id.distance(target), c.clone()))
            .collect();
        contacts.sort_by_key(|(d, _)| *d);
        contacts.truncate(n);
        contacts.into_iter().map(|(_, c)| c).collect()
    }

    /// Push a candidate onto the replacement cache. FIFO, deduplicated by
    /// id, capacity equal to the bucket's.
    pub fn cache_push(&mut self, contact: Contact) {
        if self.cache.iter().any(|c| c.id == contact.id) {
            return;
        }
        self.cache.push_back(contact);
        if self.cache.len() > self.capacity {
            self.cache.pop_front();
        }
    }

    /// Take the most recent replacement candidate.
    pub fn cache_pop_newest(&mut self) -> Option<Contact> {
        self.cache.pop_back()
    }

    pub fn cache_remove(&mut self, id: &NodeId) {
        self.cache.retain(|c| c.id != *id);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Split into two children halving the range at the midpoint. Contacts
    /// and cached candidates are redistributed by the bit at `depth`;
    /// relative order is preserved on both sides.
    pub fn split(self) -> (KBucket, KBucket) {
        debug_assert!(self.depth < ID_BITS);
        let mut low = KBucket::new(
            self.prefix.with_bit(self.depth, false),
            self.depth + 1,
            self.capacity,
            self.last_refreshed,
        );
        let mut high = KBucket::new(
            self.prefix.with_bit(self.depth, true),
            self.depth + 1,
            self.capacity,
            self.last_refreshed,
        );
        for contact in self.contacts {
            if contact.id.bit(self.depth) {
                high.contacts.push(contact);
            } else {
                low.contacts.push(contact);
            }
        }
        for contact in self.cache {
            if contact.id.bit(self.depth) {
                high.cache.push_back(contact);
            } else {
                low.cache.push_back(contact);
            }
        }
        (low, high)
    }

    /// Random identifier inside this bucket's range, for refresh lookups.
    pub fn random_id_in_range<R: RngCore>(&self, rng: &mut R) -> NodeId {
        let mut id = NodeId::random(rng);
        for i in 0..self.depth {
            id = id.with_bit(i, self.prefix.bit(i));
        }
        id
    }
}
