//! Self-verifying signed items
//!
//! An item is a complete key/value record that carries everything needed to
//! check provenance and integrity: the creator's public key, a signature
//! over the canonical serialization of the signed fields, and a key derived
//! from the public key and the item name. Any recipient can validate an
//! item without trusting the peer that delivered it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::protocol::NodeId;

/// Why an item failed validation. All failures are final: the item must not
/// be stored or propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("malformed item: {0}")]
    Malformed(String),

    #[error("recomputed key does not match the item key")]
    BadKey,

    #[error("signature does not verify against the public key")]
    BadSignature,

    #[error("item has expired")]
    Expired,

    #[error("item timestamp is in the future")]
    FutureTimestamp,
}

/// A signed key/value record.
///
/// `key` is `SHA512(canon(public_key) || canon(name))`; `sig` covers the
/// canonical serialization of all fields before `public_key` plus the
/// public key itself, in the fixed order below. Timestamps are milliseconds
/// since the Unix epoch; `expires == 0` means the item never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedItem {
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub expires: u64,
    pub name: String,
    pub meta: Vec<(String, String)>,
    pub created_with: u16,
    pub public_key: Vec<u8>,
    pub sig: Vec<u8>,
    pub key: NodeId,
}

/// Append a length-prefixed byte string to the canonical stream.
fn canon_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Derive the keyspace identifier an item is stored under.
pub fn derive_key(public_key: &[u8], name: &str) -> NodeId {
    let mut stream = Vec::with_capacity(8 + public_key.len() + name.len());
    canon_bytes(&mut stream, public_key);
    canon_bytes(&mut stream, name.as_bytes());
    NodeId::hash_of(&stream)
}

impl SignedItem {
    /// Build and sign a complete item.
    ///
    /// `now_wall` becomes the creation timestamp. A nonzero `expires` must
    /// lie after it.
    pub fn build(
        value: Vec<u8>,
        name: &str,
        expires: u64,
        meta: Vec<(String, String)>,
        keypair: &Keypair,
        version: u16,
        now_wall: u64,
    ) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::Malformed("empty name".into()));
        }
        if expires != 0 && expires <= now_wall {
            return Err(ValidationError::Malformed(
                "expiry not after creation time".into(),
            ));
        }

        let public_key = keypair.public_key().to_vec();
        let key = derive_key(&public_key, name);
        let mut item = Self {
            value,
            timestamp: now_wall,
            expires,
            name: name.to_string(),
            meta,
            created_with: version,
            public_key,
            sig: Vec::new(),
            key,
        };
        item.sig = keypair.sign(&item.signable_bytes());
        Ok(item)
    }

    /// Canonical serialization of the signed fields, in fixed order.
    ///
    /// Field order and integer widths are part of the wire contract:
    /// re-serializing a parsed item must yield identical bytes.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.value.len() + self.name.len());
        canon_bytes(&mut out, &self.value);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.expires.to_le_bytes());
        canon_bytes(&mut out, self.name.as_bytes());
        out.extend_from_slice(&(self.meta.len() as u32).to_le_bytes());
        for (k, v) in &self.meta {
            canon_bytes(&mut out, k.as_bytes());
            canon_bytes(&mut out, v.as_bytes());
        }
        out.extend_from_slice(&self.created_with.to_le_bytes());
        canon_bytes(&mut out, &self.public_key);
        out
    }

    /// Full validation against the current wall clock.
    pub fn verify(&self, now_wall: u64, skew_ms: u64) -> Result<(), ValidationError> {
        if self.public_key.len() != PUBLIC_KEY_LEN {
            return Err(ValidationError::Malformed("bad public key length".into()));
        }
        if self.sig.len() != SIGNATURE_LEN {
            return Err(ValidationError::Malformed("bad signature length".into()));
        }
        if self.name.is_empty() {
            return Err(ValidationError::Malformed("empty name".into()));
        }
        if self.expires != 0 && self.expires <= self.timestamp {
            return Err(ValidationError::Malformed(
                "expiry not after creation time".into(),
            ));
        }

        if derive_key(&self.public_key, &self.name) != self.key {
            return Err(ValidationError::BadKey);
        }
        if !crypto::verify_detached(&self.public_key, &self.signable_bytes(), &self.sig) {
            return Err(ValidationError::BadSignature);
        }
        if self.timestamp > now_wall.saturating_add(skew_ms) {
            return Err(ValidationError::FutureTimestamp);
        }
        if self.expires != 0 && self.expires < now_wall {
            return Err(ValidationError::Expired);
        }
        Ok(())
    }

    /// Replacement precedence between two items stored under the same key:
    /// larger timestamp wins, ties broken by lexicographic signature bytes.
    pub fn supersedes(&self, other: &SignedItem) -> bool {
        (self.timestamp, &self.sig) > (other.timestamp, &other.sig)
    }
}
