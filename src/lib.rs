//! Verikad - a peer-to-peer key/value store over a self-verifying DHT
//!
//! Peers organize themselves by 512-bit identifiers in a shared XOR
//! keyspace. Every stored item carries a signature binding it to its
//! creator's public key, so any recipient can check provenance and
//! integrity without trusting intermediaries.
//!
//! The crate is transport-agnostic: embedders hand the engine an outbound
//! [`transport::Transport`] and an inbound event stream, plus a
//! [`utils::Clock`]. See [`node::spawn_node`] for the entry point.

pub mod config;
pub mod crypto;
pub mod error;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use crypto::item::{derive_key, SignedItem, ValidationError};
pub use crypto::Keypair;
pub use error::{Error, Result};
pub use node::{spawn_node, Node, NodeStats, StoreReport};
pub use protocol::message::PeerInfo;
pub use protocol::NodeId;
