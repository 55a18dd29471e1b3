//! Transport seam
//!
//! The core does not own sockets. It is handed an outbound `Transport` and
//! an inbound stream of datagram events; everything above that (signature
//! checks included) happens in the engine regardless of any channel-level
//! authentication the transport may add.

pub mod memory;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{MemoryNetwork, MemoryTransport};

/// Outbound half of a datagram transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame to a peer. Errors are per-request: the caller
    /// records a contact failure and moves on.
    async fn send(&self, dest: SocketAddr, frame: Vec<u8>) -> Result<()>;
}

/// Inbound events delivered to the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Datagram {
        source: SocketAddr,
        frame: Vec<u8>,
    },
}
