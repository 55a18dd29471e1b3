//! Cryptographic primitives for Verikad
//!
//! - Ed25519 key management for node identity and item signing
//! - Self-verifying signed items (see `item`)
//!
//! A node's position in the keyspace is bound to its key material: the node
//! ID is the SHA-512 digest of the Ed25519 public key.

pub mod item;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::protocol::NodeId;

/// Length of an Ed25519 public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an Ed25519 signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 keypair for signing and identity
#[derive(Debug, Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    /// Generate a new keypair from the OS RNG
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from an existing 32-byte seed. The seed is wiped afterwards.
    pub fn from_seed(mut seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.verifying_key.to_bytes()
    }

    /// Node identifier derived from the public key
    pub fn node_id(&self) -> NodeId {
        NodeId::hash_of(&self.public_key())
    }

    /// Sign arbitrary bytes, returning the detached signature
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

/// Verify a detached signature against a raw public key.
///
/// Returns false for malformed key or signature material rather than
/// erroring; callers only care whether the bytes check out.
pub fn verify_detached(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let pk_bytes: [u8; PUBLIC_KEY_LEN] = match public_key.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&pk_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    let sig_bytes: [u8; SIGNATURE_LEN] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key.verify(data, &sig).is_ok()
}
