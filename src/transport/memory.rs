//! In-memory datagram network for tests and simulations
//!
//! A hub routes frames between attached endpoints by address. Delivery is
//! lossy like a real datagram transport: a full inbox drops the frame, and
//! sending to a detached address fails.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

const INBOX_DEPTH: usize = 256;

#[derive(Default)]
struct Hub {
    inboxes: HashMap<SocketAddr, mpsc::Sender<TransportEvent>>,
}

/// Shared fabric connecting `MemoryTransport` endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint. Returns its outbound transport and the inbound
    /// event stream to hand to the node engine.
    pub fn attach(&self, addr: SocketAddr) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        self.hub
            .lock()
            .expect("hub lock poisoned")
            .inboxes
            .insert(addr, tx);
        (
            MemoryTransport {
                addr,
                hub: self.hub.clone(),
            },
            rx,
        )
    }

    /// Detach an endpoint; frames to it fail from now on.
    pub fn detach(&self, addr: &SocketAddr) {
        self.hub
            .lock()
            .expect("hub lock poisoned")
            .inboxes
            .remove(addr);
    }
}

/// Outbound endpoint on a `MemoryNetwork`.
pub struct MemoryTransport {
    addr: SocketAddr,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, dest: SocketAddr, frame: Vec<u8>) -> Result<()> {
        let tx = {
            let hub = self.hub.lock().expect("hub lock poisoned");
            hub.inboxes.get(&dest).cloned()
        };
        let tx = tx.ok_or_else(|| Error::Transport(format!("no endpoint at {}", dest)))?;
        // Datagram semantics: a full inbox silently drops the frame.
        let _ = tx.try_send(TransportEvent::Datagram {
            source: self.addr,
            frame,
        });
        Ok(())
    }
}
