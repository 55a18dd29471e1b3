//! Iterative lookup sessions
//!
//! A lookup is a state machine owned by the node engine. The engine feeds
//! it responses, failures, and clock readings; the machine decides which
//! contacts to query next and when the traversal has converged.
//!
//! Convergence rule: new requests are launched while the nearest observed
//! id keeps improving; once it stalls, the machine waits for the in-flight
//! window to drain and then force-contacts any of the K nearest ids that
//! were skipped. The lookup ends when the K nearest observed ids have all
//! been queried (or a value was found, or the deadline passed).

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::crypto::item::SignedItem;
use crate::protocol::{Distance, NodeId};
use crate::routing::Contact;

/// What the lookup is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Node,
    Value,
}

/// Terminal failures surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailure {
    NoPeers,
    Timeout,
    ValueNotFound,
}

/// Terminal result of a lookup.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// K closest successfully-contacted peers, sorted by distance.
    Nodes(Vec<Contact>),
    /// A verified item, plus the closest observed peer that did not hold
    /// it (the opportunistic caching target).
    Value {
        item: SignedItem,
        cache_to: Option<Contact>,
    },
    Failed(LookupFailure),
}

/// Instruction back to the engine after driving the machine.
#[derive(Debug)]
pub struct Advance {
    /// Contacts to send the lookup RPC to now.
    pub send_to: Vec<Contact>,
    /// Whether the lookup has reached an outcome.
    pub done: bool,
}

/// In-progress lookup state.
pub struct LookupState {
    target: NodeId,
    kind: LookupKind,
    self_id: NodeId,
    alpha: usize,
    k: usize,
    deadline: u64,

    /// Candidates sorted by distance to the target.
    shortlist: Vec<Contact>,
    /// Ids we have sent a request to.
    contacted: HashSet<NodeId>,
    /// Peers that answered, by id.
    responded: HashMap<NodeId, Contact>,
    /// In-flight requests, the sole truth for what is outstanding.
    pending: HashMap<Uuid, Contact>,
    /// Responders to a FIND_VALUE that did not hold the value.
    non_holders: Vec<NodeId>,

    nearest: Distance,
    /// Set when a response failed to improve `nearest`; blocks
    /// response-driven refills until the in-flight window drains.
    stalled: bool,
    outcome: Option<LookupOutcome>,
}

impl LookupState {
    /// Seed a lookup from the routing table's nearest contacts.
    pub fn new(
        target: NodeId,
        kind: LookupKind,
        self_id: NodeId,
        seeds: Vec<Contact>,
        alpha: usize,
        k: usize,
        deadline: u64,
    ) -> Result<Self, LookupFailure> {
        let mut shortlist: Vec<Contact> = Vec::new();
        for seed in seeds {
            if seed.id != self_id && !shortlist.iter().any(|c| c.id == seed.id) {
                shortlist.push(seed);
            }
        }
        if shortlist.is_empty() {
            return Err(LookupFailure::NoPeers);
        }
        shortlist.sort_by_key(|c| c.id.distance(&target));
        let nearest = shortlist[0].id.distance(&target);

        Ok(Self {
            target,
            kind,
            self_id,
            alpha,
            k,
            deadline,
            shortlist,
            contacted: HashSet::new(),
            responded: HashMap::new(),
            pending: HashMap::new(),
            non_holders: Vec::new(),
            nearest,
            stalled: false,
            outcome: None,
        })
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn kind(&self) -> LookupKind {
        self.kind
    }

    pub fn outcome(&self) -> Option<&LookupOutcome> {
        self.outcome.as_ref()
    }

    /// Consume the terminal outcome once the lookup is done.
    pub fn take_outcome(&mut self) -> Option<LookupOutcome> {
        self.outcome.take()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record that the engine sent a request to `contact`.
    pub fn register(&mut self, uuid: Uuid, contact: Contact) {
        self.pending.insert(uuid, contact);
    }

    /// Drain the in-flight set (on completion or cancellation). The engine
    /// forgets these uuids; late responses only refresh the routing table.
    pub fn take_pending(&mut self) -> Vec<Uuid> {
        self.pending.drain().map(|(uuid, _)| uuid).collect()
    }

    /// Network failure or timeout for one request. Returns the failed
    /// contact so the engine can bump its failure count.
    pub fn on_failure(&mut self, uuid: &Uuid) -> Option<Contact> {
        let contact = self.pending.remove(uuid)?;
        self.shortlist.retain(|c| c.id != contact.id);
        // A failure frees a slot immediately; refills are allowed even
        // while the nearest id is not improving.
        self.stalled = false;
        Some(contact)
    }

    /// A FIND_VALUE responder returned an item that failed verification.
    /// Same treatment as a network failure; other requests keep flying.
    pub fn on_invalid_value(&mut self, uuid: &Uuid) -> Option<Contact> {
        self.on_failure(uuid)
    }

    /// Merge a NODES response.
    pub fn on_nodes(&mut self, uuid: &Uuid, peers: Vec<Contact>) -> bool {
        let Some(responder) = self.pending.remove(uuid) else {
            return false;
        };
        self.responded.insert(responder.id, responder.clone());
        if self.kind == LookupKind::Value {
            self.non_holders.push(responder.id);
        }

        for peer in peers {
            if peer.id == self.self_id
                || self.contacted.contains(&peer.id)
                || self.shortlist.iter().any(|c| c.id == peer.id)
            {
                continue;
            }
            self.shortlist.push(peer);
        }
        self.shortlist.sort_by_key(|c| c.id.distance(&self.target));

        let best = self.shortlist[0].id.distance(&self.target);
        if best < self.nearest {
            self.nearest = best;
            self.stalled = false;
            true
        } else {
            self.stalled = true;
            false
        }
    }

    /// A verified value arrived. Ends the lookup.
    pub fn on_value(&mut self, uuid: &Uuid, item: SignedItem) -> bool {
        let Some(responder) = self.pending.remove(uuid) else {
            return false;
        };
        self.responded.insert(responder.id, responder);

        let cache_to = self
            .non_holders
            .iter()
            .filter_map(|id| self.responded.get(id))
            .min_by_key(|c| c.id.distance(&self.target))
            .cloned();
        self.outcome = Some(LookupOutcome::Value { item, cache_to });
        true
    }

    /// Drive the machine: launch requests up to α, detect termination,
    /// enforce the deadline.
    pub fn advance(&mut self, now: u64) -> Advance {
        if self.outcome.is_some() {
            return Advance {
                send_to: Vec::new(),
                done: true,
            };
        }
        if now >= self.deadline {
            self.outcome = Some(LookupOutcome::Failed(LookupFailure::Timeout));
            return Advance {
                send_to: Vec::new(),
                done: true,
            };
        }

        // While stalled, no new requests ride on responses; but once the
        // window drains we force-contact the skipped near ids.
        let send_to = if !self.stalled || self.pending.is_empty() {
            self.next_requests()
        } else {
            Vec::new()
        };

        if send_to.is_empty() && self.pending.is_empty() {
            let outcome = match self.kind {
                LookupKind::Node => LookupOutcome::Nodes(self.closest_responded()),
                LookupKind::Value => LookupOutcome::Failed(LookupFailure::ValueNotFound),
            };
            self.outcome = Some(outcome);
            return Advance {
                send_to: Vec::new(),
                done: true,
            };
        }

        Advance {
            send_to,
            done: false,
        }
    }

    /// Pick uncontacted contacts from the K-nearest prefix, closest first,
    /// until the in-flight window reaches α.
    fn next_requests(&mut self) -> Vec<Contact> {
        let mut picked: Vec<Contact> = Vec::new();
        while self.pending.len() + picked.len() < self.alpha {
            let next = self
                .shortlist
                .iter()
                .take(self.k)
                .find(|c| !self.contacted.contains(&c.id))
                .cloned();
            match next {
                Some(contact) => {
                    self.contacted.insert(contact.id);
                    picked.push(contact);
                }
                None => break,
            }
        }
        picked
    }

    fn closest_responded(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.responded.values().cloned().collect();
        contacts.sort_by_key(|c| c.id.distance(&self.target));
        contacts.truncate(self.k);
        contacts
    }
}
