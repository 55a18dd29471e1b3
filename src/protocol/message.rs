//! Wire message layer
//!
//! Every frame is a signed `Envelope`: a correlation uuid, the sender's
//! identity material, a typed payload, and a signature over the canonical
//! form (the envelope minus the signature field). Recipients verify the
//! signature and the sender-ID binding before any other processing.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::item::{SignedItem, ValidationError};
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::protocol::NodeId;

/// Out-of-band failure codes carried by `Payload::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Malformed = 1,
    Signature = 2,
    Version = 3,
    Internal = 4,
    Unsupported = 5,
}

/// Contact information as it travels on the wire.
///
/// Liveness bookkeeping (last-seen, failure counts) is local state and never
/// serialized; see `routing::Contact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub version: u16,
}

/// Typed message payloads, request and response kinds together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Ping,
    Pong,
    Store(SignedItem),
    StoreOk,
    StoreErr(ValidationError),
    FindNode(NodeId),
    FindValue(NodeId),
    Nodes(Vec<PeerInfo>),
    Value(SignedItem),
    Error {
        code: ErrorCode,
        detail: String,
        original: Uuid,
    },
}

impl Payload {
    /// Whether this payload answers an earlier request (correlated by uuid).
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::Pong
                | Payload::StoreOk
                | Payload::StoreErr(_)
                | Payload::Nodes(_)
                | Payload::Value(_)
        )
    }
}

/// A complete signed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub uuid: Uuid,
    pub sender_id: NodeId,
    pub sender_public_key: Vec<u8>,
    pub version: u16,
    pub reply_port: u16,
    pub payload: Payload,
    pub signature: Vec<u8>,
}

/// Canonical signable view: the envelope with the signature omitted.
/// Field order is fixed; serialization is deterministic bincode.
#[derive(Serialize)]
struct SignableView<'a> {
    uuid: &'a Uuid,
    sender_id: &'a NodeId,
    sender_public_key: &'a [u8],
    version: u16,
    reply_port: u16,
    payload: &'a Payload,
}

impl Envelope {
    /// Build and sign a frame.
    pub fn build(
        keypair: &Keypair,
        uuid: Uuid,
        version: u16,
        reply_port: u16,
        payload: Payload,
    ) -> Result<Self> {
        let sender_public_key = keypair.public_key().to_vec();
        let sender_id = keypair.node_id();
        let view = SignableView {
            uuid: &uuid,
            sender_id: &sender_id,
            sender_public_key: &sender_public_key,
            version,
            reply_port,
            payload: &payload,
        };
        let signature = keypair.sign(&bincode::serialize(&view)?);
        Ok(Self {
            uuid,
            sender_id,
            sender_public_key,
            version,
            reply_port,
            payload,
            signature,
        })
    }

    /// Bytes covered by the signature.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        let view = SignableView {
            uuid: &self.uuid,
            sender_id: &self.sender_id,
            sender_public_key: &self.sender_public_key,
            version: self.version,
            reply_port: self.reply_port,
            payload: &self.payload,
        };
        Ok(bincode::serialize(&view)?)
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a frame. Does not validate; see [`Envelope::validate`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("bad frame: {}", e)))
    }

    /// Protocol-level validation: version compatibility, signature, and the
    /// sender-ID binding (`sender_id == SHA512(sender_public_key)`).
    pub fn validate(&self, expected_version: u16) -> std::result::Result<(), (ErrorCode, String)> {
        if self.version != expected_version {
            return Err((
                ErrorCode::Version,
                format!("version {} unsupported", self.version),
            ));
        }
        if NodeId::hash_of(&self.sender_public_key) != self.sender_id {
            return Err((
                ErrorCode::Signature,
                "sender id does not match public key".into(),
            ));
        }
        let signable = self
            .signable_bytes()
            .map_err(|e| (ErrorCode::Malformed, e.to_string()))?;
        if !crypto::verify_detached(&self.sender_public_key, &signable, &self.signature) {
            return Err((ErrorCode::Signature, "envelope signature invalid".into()));
        }
        Ok(())
    }
}
