//! Peer routing state
//!
//! - `Contact`: what the node remembers about a peer
//! - `bucket`: capacity-K contact lists covering keyspace ranges
//! - `table`: the binary prefix trie of buckets

pub mod bucket;
pub mod table;

use std::net::SocketAddr;

use crate::protocol::message::PeerInfo;
use crate::protocol::NodeId;

pub use bucket::{BucketInsert, KBucket};
pub use table::{RoutingTable, TableInsert};

/// Routing record for a known peer.
///
/// The id is immutable; `last_seen` is bumped on any successfully parsed
/// inbound message from the peer, and `failures` grows monotonically until
/// the contact is evicted or a valid response resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub address: SocketAddr,
    pub version: u16,
    pub last_seen: u64,
    pub failures: u32,
}

impl Contact {
    pub fn new(id: NodeId, address: SocketAddr, version: u16, now: u64) -> Self {
        Self {
            id,
            address,
            version,
            last_seen: now,
            failures: 0,
        }
    }

    pub fn from_peer_info(info: &PeerInfo, now: u64) -> Self {
        Self::new(info.id, info.address, info.version, now)
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            address: self.address,
            version: self.version,
        }
    }

    /// Record a successfully parsed message from this peer.
    pub fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Record an unreplied or failed request; returns the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// A valid response clears the failure streak.
    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }
}
