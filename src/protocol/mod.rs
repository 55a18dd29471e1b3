//! Core protocol types for Verikad
//!
//! This module defines the 512-bit identifier space the network is organized
//! around, the XOR distance metric over it, and the wire message layer.

pub mod message;

use std::fmt;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

/// Number of bits in an identifier
pub const ID_BITS: usize = 512;
/// Number of bytes in an identifier
pub const ID_BYTES: usize = ID_BITS / 8;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u16 = 1;

/// Bucket capacity / replication factor
pub const DEFAULT_K: usize = 20;
/// Lookup parallelism
pub const DEFAULT_ALPHA: usize = 3;

/// A 512-bit identifier in the shared keyspace.
///
/// Both peers and stored items live in the same space: peer IDs are SHA-512
/// digests of public keys, item keys are SHA-512 digests of the canonical
/// `(public_key, name)` concatenation. Interpreted big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_BYTES]);

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// SHA-512 digest of arbitrary input, as an identifier.
    pub fn hash_of(input: &[u8]) -> Self {
        let digest = Sha512::digest(input);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        NodeId(bytes)
    }

    /// Uniformly random identifier.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Bit at position `i`, MSB-first (bit 0 is the highest-order bit).
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < ID_BITS);
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Copy of this identifier with bit `i` set to `value`.
    pub fn with_bit(&self, i: usize, value: bool) -> Self {
        debug_assert!(i < ID_BITS);
        let mut bytes = self.0;
        let mask = 0x80 >> (i % 8);
        if value {
            bytes[i / 8] |= mask;
        } else {
            bytes[i / 8] &= !mask;
        }
        NodeId(bytes)
    }

    /// Whether the first `depth` bits of `self` equal those of `prefix`.
    pub fn matches_prefix(&self, prefix: &NodeId, depth: usize) -> bool {
        debug_assert!(depth <= ID_BITS);
        let full_bytes = depth / 8;
        if self.0[..full_bytes] != prefix.0[..full_bytes] {
            return false;
        }
        let rem = depth % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        (self.0[full_bytes] ^ prefix.0[full_bytes]) & mask == 0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Short hex form for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes", ID_BYTES)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
        let bytes: [u8; ID_BYTES] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(NodeId(bytes))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
        let mut bytes = [0u8; ID_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(NodeId(bytes))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

/// XOR distance metric between two identifiers.
///
/// Smaller means closer. The ordering is the big-endian integer ordering of
/// the XOR, which is what the derived lexicographic byte order gives us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);
    pub const MAX: Distance = Distance([0xFFu8; ID_BYTES]);

    /// Number of leading zero bits, i.e. the length of the shared prefix of
    /// the two identifiers the distance was computed from.
    pub fn leading_zeros(&self) -> u32 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i as u32 * 8 + byte.leading_zeros();
            }
        }
        ID_BITS as u32
    }

    /// Bucket index per the flat layout: `ID_BITS - 1 - floor(log2(d))`.
    ///
    /// Undefined (None) for the zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        let lz = self.leading_zeros() as usize;
        if lz >= ID_BITS {
            None
        } else {
            Some(lz)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}
