//! Routing table: a binary prefix trie of k-buckets
//!
//! The table starts as a single bucket covering the whole keyspace and
//! splits on demand. A full bucket splits only while its range contains the
//! node's own id (or under the optional depth-stride relaxation); otherwise
//! new candidates go to the bucket's replacement cache and the caller is
//! asked to probe the stalest contact for liveness.

use rand::RngCore;
use tracing::{debug, warn};

use crate::protocol::{Distance, NodeId, ID_BITS};
use crate::routing::bucket::{BucketInsert, KBucket};
use crate::routing::Contact;

/// Outcome of a routing-table insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableInsert {
    /// Contact stored in its bucket
    Added,
    /// Contact was known; bumped to most-recently-seen
    Refreshed,
    /// Bucket full and unsplittable: candidate cached, caller should probe
    /// the bucket head for liveness
    Deferred { probe: Contact },
    /// The node's own id is never stored
    RejectedSelf,
}

/// Binary trie of buckets, keyed around the owning node's id.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<KBucket>,
    k: usize,
    max_failures: u32,
    split_stride: usize,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize, max_failures: u32, split_stride: usize, now: u64) -> Self {
        Self {
            self_id,
            buckets: vec![KBucket::new(NodeId::ZERO, 0, k, now)],
            k,
            max_failures,
            split_stride,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Total number of stored contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Index of the unique bucket whose range contains `id`.
    fn bucket_index_of(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .expect("buckets partition the keyspace")
    }

    pub fn contact(&self, id: &NodeId) -> Option<&Contact> {
        self.buckets[self.bucket_index_of(id)].get(id)
    }

    /// Offer a contact to the table, splitting buckets as allowed.
    pub fn insert(&mut self, contact: Contact, now: u64) -> TableInsert {
        if contact.id == self.self_id {
            return TableInsert::RejectedSelf;
        }
        loop {
            let idx = self.bucket_index_of(&contact.id);
            match self.buckets[idx].insert(contact.clone(), now) {
                BucketInsert::Added => {
                    debug_assert!(self.buckets[idx].len() <= self.k);
                    return TableInsert::Added;
                }
                BucketInsert::Refreshed => return TableInsert::Refreshed,
                BucketInsert::Full => {
                    if self.can_split(idx) {
                        self.split_bucket(idx);
                        continue;
                    }
                    let probe = self.buckets[idx]
                        .head()
                        .cloned()
                        .expect("full bucket has a head");
                    self.buckets[idx].cache_push(contact);
                    return TableInsert::Deferred { probe };
                }
            }
        }
    }

    fn can_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        if bucket.depth() >= ID_BITS {
            return false;
        }
        bucket.covers(&self.self_id)
            || (self.split_stride > 1 && bucket.depth() % self.split_stride != 0)
    }

    fn split_bucket(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        debug!(
            depth = bucket.depth(),
            prefix = %bucket.prefix().short_hex(),
            "splitting bucket"
        );
        let (low, high) = bucket.split();
        // Children replace the parent in place, keeping prefix order.
        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    /// The `n` known contacts closest to `target`, optionally excluding one
    /// id (typically the requester).
    pub fn k_closest(&self, target: &NodeId, n: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts().iter())
            .filter(|c| exclude.map_or(true, |x| c.id != *x))
            .cloned()
            .collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(n);
        all
    }

    /// Record a successfully validated message from a known contact.
    pub fn confirm(&mut self, id: &NodeId, now: u64) {
        let idx = self.bucket_index_of(id);
        if let Some(contact) = self.buckets[idx].get_mut(id) {
            contact.reset_failures();
        }
        self.buckets[idx].touch(id, now);
    }

    /// Bump a contact's failure count, evicting it (and promoting a cached
    /// replacement) once it reaches the configured limit. Returns true when
    /// the contact was evicted.
    pub fn record_failure(&mut self, id: &NodeId, now: u64) -> bool {
        let idx = self.bucket_index_of(id);
        let evict = match self.buckets[idx].get_mut(id) {
            Some(contact) => contact.record_failure() >= self.max_failures,
            None => return false,
        };
        if evict {
            warn!(peer = %id.short_hex(), "evicting unresponsive contact");
            self.buckets[idx].remove(id);
            self.promote_from_cache(idx, now);
        }
        evict
    }

    /// Drop a contact unconditionally (failed liveness probe) and promote
    /// the most recent viable replacement-cache entry.
    pub fn evict(&mut self, id: &NodeId, now: u64) {
        let idx = self.bucket_index_of(id);
        if self.buckets[idx].remove(id).is_some() {
            self.promote_from_cache(idx, now);
        }
    }

    fn promote_from_cache(&mut self, idx: usize, now: u64) {
        while self.buckets[idx].len() < self.k {
            let Some(mut candidate) = self.buckets[idx].cache_pop_newest() else {
                return;
            };
            candidate.touch(now);
            if self.buckets[idx].insert(candidate, now) == BucketInsert::Added {
                return;
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index_of(id);
        self.buckets[idx].remove(id)
    }

    /// Mark the bucket covering `target` as recently refreshed (a lookup in
    /// its range just happened).
    pub fn note_lookup(&mut self, target: &NodeId, now: u64) {
        let idx = self.bucket_index_of(target);
        self.buckets[idx].last_refreshed = now;
    }

    /// Random targets inside every bucket that has not been refreshed for
    /// `interval` milliseconds. Marks those buckets refreshed at `now`.
    pub fn refresh_targets<R: RngCore>(
        &mut self,
        now: u64,
        interval: u64,
        rng: &mut R,
    ) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for bucket in &mut self.buckets {
            if now.saturating_sub(bucket.last_refreshed) >= interval {
                bucket.last_refreshed = now;
                targets.push(bucket.random_id_in_range(rng));
            }
        }
        targets
    }

    /// Random targets for every bucket farther from `self` than `neighbor`
    /// (used after join to populate the distant reaches of the table).
    pub fn refresh_targets_beyond<R: RngCore>(
        &mut self,
        neighbor: &NodeId,
        now: u64,
        rng: &mut R,
    ) -> Vec<NodeId> {
        let neighbor_shared = self.self_id.distance(neighbor).leading_zeros();
        let self_id = self.self_id;
        let mut targets = Vec::new();
        for bucket in &mut self.buckets {
            let divergence = self_id
                .distance(bucket.prefix())
                .leading_zeros()
                .min(bucket.depth() as u32);
            if divergence < neighbor_shared {
                bucket.last_refreshed = now;
                targets.push(bucket.random_id_in_range(rng));
            }
        }
        targets
    }

    /// Depth of the deepest bucket: the granularity of the node's home
    /// neighborhood. Keys whose shared prefix with `self` is shorter than
    /// this are considered far (cache-pruning candidates).
    pub fn deepest_depth(&self) -> usize {
        self.buckets.iter().map(|b| b.depth()).max().unwrap_or(0)
    }

    /// Whether `key` lies outside the node's home neighborhood.
    pub fn is_far(&self, key: &NodeId) -> bool {
        let shared = self.self_id.distance(key).leading_zeros() as usize;
        shared < self.deepest_depth()
    }

    /// Shared-prefix length between self and `other`.
    pub fn shared_prefix(&self, other: &NodeId) -> u32 {
        self.self_id.distance(other).leading_zeros()
    }

    /// Check structural invariants. Used by tests; cheap enough to run
    /// after mutation in debug builds.
    pub fn check_invariants(&self) -> Result<(), String> {
        for bucket in &self.buckets {
            if bucket.len() > self.k {
                return Err(format!("bucket over capacity: {}", bucket.len()));
            }
            for contact in bucket.contacts() {
                if contact.id == self.self_id {
                    return Err("own id stored in table".into());
                }
                let covering = self
                    .buckets
                    .iter()
                    .filter(|b| b.covers(&contact.id))
                    .count();
                if covering != 1 {
                    return Err(format!("{} buckets cover {}", covering, contact.id));
                }
            }
        }
        Ok(())
    }

    pub fn distance_to(&self, id: &NodeId) -> Distance {
        self.self_id.distance(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const K: usize = 5;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Identifier with `value` in its top ten bits; the rest zero. Lets the
    /// tests reason in a small keyspace while exercising the real one.
    fn top10(value: u16) -> NodeId {
        assert!(value < 1024);
        let mut bytes = [0u8; 64];
        bytes[0] = (value >> 2) as u8;
        bytes[1] = ((value & 0b11) << 6) as u8;
        NodeId::from_bytes(bytes)
    }

    fn contact_for(value: u16) -> Contact {
        Contact::new(top10(value), addr(10_000 + value), 1, 0)
    }

    fn table_around(self_value: u16) -> RoutingTable {
        RoutingTable::new(top10(self_value), K, 3, 1, 0)
    }

    fn bucket_values(table: &RoutingTable, idx: usize) -> Vec<u16> {
        let mut values: Vec<u16> = table.buckets()[idx]
            .contacts()
            .iter()
            .map(|c| {
                let b = c.id.as_bytes();
                ((b[0] as u16) << 2) | ((b[1] as u16) >> 6)
            })
            .collect();
        values.sort();
        values
    }

    #[test]
    fn own_id_rejected() {
        let mut table = table_around(234);
        let me = Contact::new(top10(234), addr(1), 1, 0);
        assert_eq!(table.insert(me, 0), TableInsert::RejectedSelf);
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_containing_self_splits_at_midpoint() {
        let mut table = table_around(234);
        for v in [1, 123, 456, 765, 876] {
            assert_eq!(table.insert(contact_for(v), 0), TableInsert::Added);
        }
        assert_eq!(table.bucket_count(), 1);

        // Sixth insert forces a split halving the range at 512.
        assert_eq!(table.insert(contact_for(567), 0), TableInsert::Added);
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(bucket_values(&table, 0), vec![1, 123, 456]);
        assert_eq!(bucket_values(&table, 1), vec![567, 765, 876]);
        table.check_invariants().unwrap();
    }

    #[test]
    fn low_bucket_resplits_when_filled() {
        let mut table = table_around(234);
        for v in [1, 123, 456, 765, 876, 567] {
            table.insert(contact_for(v), 0);
        }
        // Fill the low half (which still contains self) to capacity.
        table.insert(contact_for(100), 0);
        table.insert(contact_for(200), 0);
        assert_eq!(bucket_values(&table, 0), vec![1, 100, 123, 200, 456]);

        // Next low-side insert halves [0, 512) at 256.
        assert_eq!(table.insert(contact_for(343), 0), TableInsert::Added);
        assert_eq!(table.bucket_count(), 3);
        assert_eq!(bucket_values(&table, 0), vec![1, 100, 123, 200]);
        assert_eq!(bucket_values(&table, 1), vec![343, 456]);
        assert_eq!(bucket_values(&table, 2), vec![567, 765, 876]);
        table.check_invariants().unwrap();
    }

    #[test]
    fn far_bucket_defers_instead_of_splitting() {
        let mut table = table_around(1);
        // Self is deep in the low half; the high half cannot split.
        for v in [1, 2, 3, 4, 5] {
            table.insert(contact_for(512 + v), 0);
        }
        // Force enough splits that [512, 1024) is its own bucket first.
        for v in [2, 3, 6, 7, 8, 9] {
            table.insert(contact_for(v), 0);
        }
        let high_idx = table
            .buckets()
            .iter()
            .position(|b| b.covers(&top10(700)))
            .unwrap();
        if table.buckets()[high_idx].len() < K {
            for v in 6..20 {
                table.insert(contact_for(512 + v), 0);
            }
        }
        let candidate = contact_for(900);
        match table.insert(candidate, 0) {
            TableInsert::Deferred { probe } => {
                // The probe victim is the stalest contact of the full bucket.
                let head = table.buckets()[high_idx].head().unwrap();
                assert_eq!(probe.id, head.id);
            }
            other => panic!("expected Deferred, got {:?}", other),
        }
        table.check_invariants().unwrap();
    }

    #[test]
    fn failure_limit_evicts_and_promotes_from_cache() {
        let mut table = table_around(1);
        // One far bucket, filled, plus cached candidates.
        for v in 0..K as u16 {
            table.insert(contact_for(512 + v), 0);
        }
        for v in [2, 3, 6, 7, 8, 9] {
            table.insert(contact_for(v), 0);
        }
        for v in 5..30u16 {
            table.insert(contact_for(512 + v), 0);
        }
        let high_idx = table
            .buckets()
            .iter()
            .position(|b| b.covers(&top10(512)))
            .unwrap();
        assert_eq!(table.buckets()[high_idx].len(), K);
        assert!(table.buckets()[high_idx].cache_len() > 0);

        let victim = table.buckets()[high_idx].head().unwrap().id;
        assert!(!table.record_failure(&victim, 1));
        assert!(!table.record_failure(&victim, 2));
        assert!(table.record_failure(&victim, 3));

        assert!(table.contact(&victim).is_none());
        // Promotion kept the bucket full.
        assert_eq!(table.buckets()[high_idx].len(), K);
        table.check_invariants().unwrap();
    }

    #[test]
    fn k_closest_is_sorted_and_bounded() {
        let mut table = table_around(0);
        for v in 1..100u16 {
            table.insert(contact_for(v), 0);
        }
        // 2 landed before any bucket filled, so it is certainly stored.
        let target = top10(2);
        let closest = table.k_closest(&target, K, None);
        assert_eq!(closest.len(), K);
        assert_eq!(closest[0].id, target);
        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }

        let excluded = table.k_closest(&target, K, Some(&target));
        assert!(excluded.iter().all(|c| c.id != target));
    }

    #[test]
    fn refresh_targets_cover_stale_buckets() {
        let mut table = table_around(234);
        for v in [1, 123, 456, 765, 876, 567] {
            table.insert(contact_for(v), 0);
        }
        let mut rng = rand::thread_rng();

        // Nothing stale yet.
        assert!(table.refresh_targets(100, 1_000, &mut rng).is_empty());

        let targets = table.refresh_targets(2_000, 1_000, &mut rng);
        assert_eq!(targets.len(), table.bucket_count());
        for (bucket, target) in table.buckets().iter().zip(&targets) {
            assert!(bucket.covers(target));
        }

        // Marked refreshed: an immediate re-check is quiet.
        assert!(table.refresh_targets(2_100, 1_000, &mut rng).is_empty());
    }

    #[test]
    fn far_keys_are_prunable() {
        let mut table = table_around(0);
        for v in 1..64u16 {
            table.insert(contact_for(v), 0);
        }
        assert!(table.deepest_depth() > 0);
        // The all-ones id shares no prefix with self.
        let far = NodeId::from_bytes([0xFF; 64]);
        assert!(table.is_far(&far));
        // A key equal to a nearby contact shares the full home prefix.
        assert!(!table.is_far(&top10(1)));
    }
}
