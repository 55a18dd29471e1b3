//! Node engine
//!
//! One cooperative task owns the routing table, the datastore, and the
//! pending-request map. Inbound frames, embedder commands, and timers are
//! multiplexed onto it; outbound frames leave through a single serialized
//! writer task. Lookups live inside the engine as state machines, so no
//! lock is ever taken around shared protocol state.

pub mod lookup;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::thread_rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::item::{self, SignedItem, ValidationError};
use crate::crypto::Keypair;
use crate::error::{Error, Result};
use crate::protocol::message::{Envelope, ErrorCode, Payload, PeerInfo};
use crate::protocol::NodeId;
use crate::routing::{Contact, RoutingTable, TableInsert};
use crate::storage::{Datastore, StoreOrigin};
use crate::transport::{Transport, TransportEvent};
use crate::utils::Clock;

use lookup::{LookupFailure, LookupKind, LookupOutcome, LookupState};

/// Per-peer outcome of a `set` fan-out.
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub key: NodeId,
    pub acks: Vec<NodeId>,
    pub nacks: Vec<(NodeId, String)>,
}

/// Counters surfaced through `Node::stats`.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub contacts: usize,
    pub buckets: usize,
    pub stored_items: usize,
    pub active_lookups: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub lookups_started: u64,
    pub lookups_completed: u64,
    pub items_expired: u64,
    pub items_pruned: u64,
}

enum Command {
    Get {
        key: NodeId,
        resp: oneshot::Sender<Result<Option<SignedItem>>>,
    },
    Set {
        name: String,
        value: Vec<u8>,
        expires: u64,
        meta: Vec<(String, String)>,
        resp: oneshot::Sender<Result<StoreReport>>,
    },
    Join {
        seeds: Vec<PeerInfo>,
        resp: oneshot::Sender<Result<()>>,
    },
    Stats {
        resp: oneshot::Sender<NodeStats>,
    },
    Leave {
        resp: oneshot::Sender<()>,
    },
}

/// Why a request is in flight. The pending map is the sole truth for what
/// is outstanding; an entry missing here means any late response only
/// refreshes the sender's contact.
enum RequestPurpose {
    /// Part of an iterative lookup session
    Lookup(u64),
    /// Liveness probe of a bucket head; eviction on timeout
    Probe { victim: NodeId },
    /// STORE fan-out tracked by a report task
    StoreOut { task: u64 },
    /// Opportunistic cache STORE; fire-and-forget
    CacheStore,
}

struct PendingRequest {
    contact: Contact,
    timeout_at: u64,
    purpose: RequestPurpose,
}

/// What to do with a finished lookup.
enum LookupAction {
    Get {
        resp: oneshot::Sender<Result<Option<SignedItem>>>,
    },
    Join {
        resp: oneshot::Sender<Result<()>>,
    },
    Set {
        resp: oneshot::Sender<Result<StoreReport>>,
        item: SignedItem,
    },
    Republish {
        item: SignedItem,
    },
    Refresh,
}

struct LookupTask {
    state: LookupState,
    action: LookupAction,
}

struct StoreTask {
    key: NodeId,
    outstanding: usize,
    acks: Vec<NodeId>,
    nacks: Vec<(NodeId, String)>,
    resp: Option<oneshot::Sender<Result<StoreReport>>>,
}

#[derive(Default)]
struct Counters {
    messages_sent: u64,
    messages_received: u64,
    lookups_started: u64,
    lookups_completed: u64,
    items_expired: u64,
    items_pruned: u64,
}

/// The engine: owns all protocol state, driven by `run`.
pub struct NodeEngine {
    config: Config,
    clock: Arc<dyn Clock>,
    keypair: Keypair,
    self_id: NodeId,
    listen_addr: SocketAddr,

    table: RoutingTable,
    store: Datastore,

    transport: Arc<dyn Transport>,
    inbound: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    outbound_rx: Option<mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>>,

    pending: HashMap<Uuid, PendingRequest>,
    lookups: HashMap<u64, LookupTask>,
    store_tasks: HashMap<u64, StoreTask>,
    next_task_id: u64,
    stats: Counters,
}

/// Cloneable handle embedders drive the engine through.
#[derive(Clone)]
pub struct Node {
    cmd: mpsc::Sender<Command>,
    id: NodeId,
    public_key: Vec<u8>,
    address: SocketAddr,
}

impl Node {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Contact info other nodes can use to seed their tables.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            address: self.address,
            version: crate::protocol::PROTOCOL_VERSION,
        }
    }

    /// Retrieve an item by publisher key and name.
    pub async fn get(&self, name: &str, publisher_public_key: &[u8]) -> Result<Option<SignedItem>> {
        self.get_key(item::derive_key(publisher_public_key, name))
            .await
    }

    /// Retrieve an item by its raw key.
    pub async fn get_key(&self, key: NodeId) -> Result<Option<SignedItem>> {
        let (resp, rx) = oneshot::channel();
        self.cmd
            .send(Command::Get { key, resp })
            .await
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    /// Build, sign, and publish an item to the K closest peers.
    pub async fn set(
        &self,
        name: &str,
        value: Vec<u8>,
        expires: u64,
        meta: Vec<(String, String)>,
    ) -> Result<StoreReport> {
        let (resp, rx) = oneshot::channel();
        self.cmd
            .send(Command::Set {
                name: name.to_string(),
                value,
                expires,
                meta,
                resp,
            })
            .await
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    /// Join the network through the given seed contacts.
    pub async fn join(&self, seeds: Vec<PeerInfo>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd
            .send(Command::Join { seeds, resp })
            .await
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let (resp, rx) = oneshot::channel();
        self.cmd
            .send(Command::Stats { resp })
            .await
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)
    }

    /// Stop the engine: timers halt and outstanding work is drained.
    pub async fn leave(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd
            .send(Command::Leave { resp })
            .await
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)
    }
}

/// Construct a node engine and spawn it onto the runtime.
pub fn spawn_node(
    keypair: Keypair,
    listen_addr: SocketAddr,
    seeds: Vec<PeerInfo>,
    config: Config,
    transport: Arc<dyn Transport>,
    inbound: mpsc::Receiver<TransportEvent>,
    clock: Arc<dyn Clock>,
) -> Result<(Node, JoinHandle<()>)> {
    let (mut engine, node) = NodeEngine::new(keypair, listen_addr, config, transport, inbound, clock)?;
    engine.seed(seeds);
    let handle = tokio::spawn(engine.run());
    Ok((node, handle))
}

impl NodeEngine {
    pub fn new(
        keypair: Keypair,
        listen_addr: SocketAddr,
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<TransportEvent>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Node)> {
        config.validate()?;
        let (cmd_tx, commands) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let self_id = keypair.node_id();
        let now = clock.now();

        let node = Node {
            cmd: cmd_tx,
            id: self_id,
            public_key: keypair.public_key().to_vec(),
            address: listen_addr,
        };
        let engine = Self {
            table: RoutingTable::new(
                self_id,
                config.k,
                config.max_failures,
                config.split_stride,
                now,
            ),
            store: Datastore::new(),
            config,
            clock,
            keypair,
            self_id,
            listen_addr,
            transport,
            inbound,
            commands,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            pending: HashMap::new(),
            lookups: HashMap::new(),
            store_tasks: HashMap::new(),
            next_task_id: 0,
            stats: Counters::default(),
        };
        Ok((engine, node))
    }

    /// Pre-populate the routing table with known contacts.
    pub fn seed(&mut self, seeds: Vec<PeerInfo>) {
        let now = self.clock.now();
        for info in seeds {
            if info.id != self.self_id {
                self.table.insert(Contact::from_peer_info(&info, now), now);
            }
        }
    }

    /// Run until `leave`. Consumes the engine.
    pub async fn run(mut self) {
        info!(id = %self.self_id.short_hex(), addr = %self.listen_addr, "node engine starting");

        // Serialized outbound writer.
        let transport = self.transport.clone();
        let mut outbound_rx = self.outbound_rx.take().expect("run called twice");
        tokio::spawn(async move {
            while let Some((dest, frame)) = outbound_rx.recv().await {
                if let Err(e) = transport.send(dest, frame).await {
                    debug!(%dest, error = %e, "outbound send failed");
                }
            }
        });

        let mut tick = interval(self.config.tick_interval);
        let mut maintenance = interval(self.config.expiry_scan_interval);

        loop {
            tokio::select! {
                Some(cmd) = self.commands.recv() => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                Some(event) = self.inbound.recv() => self.handle_event(event),
                _ = tick.tick() => self.handle_tick(),
                _ = maintenance.tick() => self.handle_maintenance(),
                else => break,
            }
        }
        self.shutdown();
    }

    // ---- command handling -------------------------------------------------

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Get { key, resp } => {
                // Local fast path before going to the network.
                if let Some(item) = self.live_item(&key) {
                    let _ = resp.send(Ok(Some(item)));
                } else {
                    self.start_lookup(key, LookupKind::Value, LookupAction::Get { resp });
                }
            }
            Command::Set {
                name,
                value,
                expires,
                meta,
                resp,
            } => match SignedItem::build(
                value,
                &name,
                expires,
                meta,
                &self.keypair,
                self.config.version,
                self.clock.wall_now(),
            ) {
                Ok(item) => {
                    let now = self.clock.now();
                    self.store.store(item.clone(), now, StoreOrigin::Local);
                    self.start_lookup(
                        item.key,
                        LookupKind::Node,
                        LookupAction::Set { resp, item },
                    );
                }
                Err(e) => {
                    let _ = resp.send(Err(e.into()));
                }
            },
            Command::Join { seeds, resp } => {
                let now = self.clock.now();
                for info in seeds {
                    if info.id != self.self_id {
                        self.observe_contact(Contact::from_peer_info(&info, now));
                    }
                }
                self.start_lookup(self.self_id, LookupKind::Node, LookupAction::Join { resp });
            }
            Command::Stats { resp } => {
                let _ = resp.send(self.snapshot_stats());
            }
            Command::Leave { resp } => {
                let _ = resp.send(());
                return true;
            }
        }
        false
    }

    fn snapshot_stats(&self) -> NodeStats {
        NodeStats {
            contacts: self.table.len(),
            buckets: self.table.bucket_count(),
            stored_items: self.store.len(),
            active_lookups: self.lookups.len(),
            messages_sent: self.stats.messages_sent,
            messages_received: self.stats.messages_received,
            lookups_started: self.stats.lookups_started,
            lookups_completed: self.stats.lookups_completed,
            items_expired: self.stats.items_expired,
            items_pruned: self.stats.items_pruned,
        }
    }

    /// Stored item under `key` if present and not past its expiry.
    fn live_item(&mut self, key: &NodeId) -> Option<SignedItem> {
        let now = self.clock.now();
        let wall = self.clock.wall_now();
        let item = self.store.get(key, now)?.clone();
        if item.expires != 0 && item.expires < wall {
            self.store.remove(key);
            return None;
        }
        Some(item)
    }

    // ---- inbound frames ---------------------------------------------------

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Datagram { source, frame } => self.handle_frame(source, frame),
        }
    }

    fn handle_frame(&mut self, src: SocketAddr, bytes: Vec<u8>) {
        self.stats.messages_received += 1;
        let now = self.clock.now();

        let env = match Envelope::decode(&bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(%src, error = %e, "dropping unparseable frame");
                self.send_error(src, ErrorCode::Malformed, e.to_string(), Uuid::nil());
                return;
            }
        };
        if let Err((code, detail)) = env.validate(self.config.version) {
            warn!(%src, code = ?code, detail = %detail, "rejecting invalid frame");
            if self.table.contact(&env.sender_id).is_some() {
                self.table.record_failure(&env.sender_id, now);
            }
            if !matches!(env.payload, Payload::Error { .. }) {
                self.send_error(src, code, detail, env.uuid);
            }
            return;
        }
        if env.sender_id == self.self_id {
            return;
        }

        // The peer's canonical address is its listening port, not the
        // ephemeral source port.
        let peer_addr = SocketAddr::new(src.ip(), env.reply_port);
        let contact = Contact::new(env.sender_id, peer_addr, env.version, now);
        self.observe_contact(contact.clone());

        match env.payload {
            Payload::Ping => self.reply(peer_addr, env.uuid, Payload::Pong),
            Payload::FindNode(target) => {
                let peers = self.closest_peer_infos(&target, &env.sender_id);
                self.reply(peer_addr, env.uuid, Payload::Nodes(peers));
            }
            Payload::FindValue(target) => match self.live_item(&target) {
                Some(found) => self.reply(peer_addr, env.uuid, Payload::Value(found)),
                None => {
                    let peers = self.closest_peer_infos(&target, &env.sender_id);
                    self.reply(peer_addr, env.uuid, Payload::Nodes(peers));
                }
            },
            Payload::Store(stored) => self.handle_store_rpc(peer_addr, env.uuid, stored),
            Payload::Error {
                code,
                detail,
                original,
            } => {
                debug!(peer = %contact.id.short_hex(), ?code, detail = %detail, "peer reported an error");
                if let Some(id) = self.note_failure(original) {
                    self.drive_lookup(id);
                }
            }
            payload if payload.is_response() => self.handle_response(contact, env.uuid, payload),
            _ => {
                self.send_error(
                    peer_addr,
                    ErrorCode::Unsupported,
                    "unsupported message kind".into(),
                    env.uuid,
                );
            }
        }
    }

    fn closest_peer_infos(&self, target: &NodeId, requester: &NodeId) -> Vec<PeerInfo> {
        self.table
            .k_closest(target, self.config.k, Some(requester))
            .iter()
            .map(Contact::peer_info)
            .collect()
    }

    fn handle_store_rpc(&mut self, peer_addr: SocketAddr, uuid: Uuid, item: SignedItem) {
        if item.value.len() > self.config.max_value_bytes {
            self.reply(
                peer_addr,
                uuid,
                Payload::StoreErr(ValidationError::Malformed("value too large".into())),
            );
            return;
        }
        let wall = self.clock.wall_now();
        let skew = self.config.clock_skew.as_millis() as u64;
        if let Err(e) = item.verify(wall, skew) {
            debug!(key = %item.key.short_hex(), error = %e, "discarding invalid item");
            self.reply(peer_addr, uuid, Payload::StoreErr(e));
            return;
        }
        let now = self.clock.now();
        self.store.store(item, now, StoreOrigin::Network);
        self.reply(peer_addr, uuid, Payload::StoreOk);
    }

    fn handle_response(&mut self, from: Contact, uuid: Uuid, payload: Payload) {
        let now = self.clock.now();
        let Some(request) = self.pending.remove(&uuid) else {
            // Unknown or abandoned: the sender's contact was already
            // refreshed, nothing else to do.
            return;
        };
        if request.contact.id != from.id {
            // Response from the wrong peer; keep waiting for the real one.
            self.pending.insert(uuid, request);
            return;
        }
        self.table.confirm(&from.id, now);

        match request.purpose {
            RequestPurpose::Probe { victim } => {
                debug!(peer = %victim.short_hex(), "bucket head answered probe");
            }
            RequestPurpose::CacheStore => {}
            RequestPurpose::StoreOut { task } => {
                let result = match payload {
                    Payload::StoreOk => Ok(()),
                    Payload::StoreErr(e) => Err(e.to_string()),
                    _ => Err("unexpected response kind".into()),
                };
                self.record_store_result(task, from.id, result);
            }
            RequestPurpose::Lookup(id) => {
                self.handle_lookup_response(id, uuid, payload, &from);
                self.drive_lookup(id);
            }
        }
    }

    fn handle_lookup_response(&mut self, id: u64, uuid: Uuid, payload: Payload, from: &Contact) {
        let now = self.clock.now();
        let wall = self.clock.wall_now();
        let skew = self.config.clock_skew.as_millis() as u64;
        let self_id = self.self_id;

        let Some(task) = self.lookups.get_mut(&id) else {
            return;
        };
        match payload {
            Payload::Nodes(peers) => {
                let contacts: Vec<Contact> = peers
                    .iter()
                    .filter(|p| p.id != self_id)
                    .map(|p| Contact::from_peer_info(p, now))
                    .collect();
                task.state.on_nodes(&uuid, contacts);
            }
            Payload::Value(found) => {
                let acceptable = task.state.kind() == LookupKind::Value
                    && found.key == *task.state.target()
                    && found.verify(wall, skew).is_ok();
                if acceptable {
                    task.state.on_value(&uuid, found);
                } else {
                    warn!(peer = %from.id.short_hex(), "peer returned an invalid value");
                    task.state.on_invalid_value(&uuid);
                    self.table.record_failure(&from.id, now);
                }
            }
            _ => {
                task.state.on_failure(&uuid);
                self.table.record_failure(&from.id, now);
            }
        }
    }

    // ---- lookups ----------------------------------------------------------

    fn start_lookup(&mut self, target: NodeId, kind: LookupKind, action: LookupAction) {
        let now = self.clock.now();
        let seeds = self.table.k_closest(&target, self.config.k, None);
        let deadline = now + self.config.lookup_deadline.as_millis() as u64;

        match LookupState::new(
            target,
            kind,
            self.self_id,
            seeds,
            self.config.alpha,
            self.config.k,
            deadline,
        ) {
            Ok(state) => {
                let id = self.next_task_id;
                self.next_task_id += 1;
                self.lookups.insert(id, LookupTask { state, action });
                self.table.note_lookup(&target, now);
                self.stats.lookups_started += 1;
                self.drive_lookup(id);
            }
            Err(_) => self.fail_action(action, Error::NoPeers),
        }
    }

    /// Advance a lookup: launch requests up to α, finish when converged.
    fn drive_lookup(&mut self, id: u64) {
        let now = self.clock.now();
        let (send_to, done, kind, target) = {
            let Some(task) = self.lookups.get_mut(&id) else {
                return;
            };
            let advance = task.state.advance(now);
            (
                advance.send_to,
                advance.done,
                task.state.kind(),
                *task.state.target(),
            )
        };
        if done {
            self.finish_lookup(id);
            return;
        }
        for contact in send_to {
            let payload = match kind {
                LookupKind::Node => Payload::FindNode(target),
                LookupKind::Value => Payload::FindValue(target),
            };
            if let Some(uuid) = self.send_request(
                &contact,
                payload,
                RequestPurpose::Lookup(id),
                self.config.request_timeout,
            ) {
                if let Some(task) = self.lookups.get_mut(&id) {
                    task.state.register(uuid, contact);
                }
            }
        }
    }

    fn finish_lookup(&mut self, id: u64) {
        let Some(mut task) = self.lookups.remove(&id) else {
            return;
        };
        // Abandon whatever is still in flight: late responses will refresh
        // the routing table but feed nothing.
        for uuid in task.state.take_pending() {
            self.pending.remove(&uuid);
        }
        self.stats.lookups_completed += 1;

        let Some(outcome) = task.state.take_outcome() else {
            self.fail_action(task.action, Error::Internal("lookup finished without outcome".into()));
            return;
        };
        match (outcome, task.action) {
            (LookupOutcome::Nodes(contacts), LookupAction::Join { resp }) => {
                if let Some(neighbor) = contacts.first() {
                    let neighbor_id = neighbor.id;
                    let _ = resp.send(Ok(()));
                    let now = self.clock.now();
                    let targets = self.table.refresh_targets_beyond(
                        &neighbor_id,
                        now,
                        &mut thread_rng(),
                    );
                    info!(peers = contacts.len(), refreshes = targets.len(), "joined network");
                    for target in targets {
                        self.start_lookup(target, LookupKind::Node, LookupAction::Refresh);
                    }
                } else {
                    let _ = resp.send(Err(Error::NoPeers));
                }
            }
            (LookupOutcome::Nodes(contacts), LookupAction::Set { resp, item }) => {
                self.begin_store_fanout(item, contacts, Some(resp));
            }
            (LookupOutcome::Nodes(contacts), LookupAction::Republish { item }) => {
                self.begin_store_fanout(item, contacts, None);
            }
            (LookupOutcome::Nodes(_), LookupAction::Refresh) => {}
            (LookupOutcome::Nodes(_), LookupAction::Get { resp }) => {
                let _ = resp.send(Err(Error::Internal("node lookup answered a get".into())));
            }
            (LookupOutcome::Value { item, cache_to }, LookupAction::Get { resp }) => {
                // Broaden the cached footprint of a popular key.
                if let Some(target) = cache_to {
                    self.send_request(
                        &target,
                        Payload::Store(item.clone()),
                        RequestPurpose::CacheStore,
                        self.config.request_timeout,
                    );
                }
                let _ = resp.send(Ok(Some(item)));
            }
            (LookupOutcome::Value { .. }, action) => {
                self.fail_action(action, Error::Internal("unexpected value outcome".into()));
            }
            (LookupOutcome::Failed(failure), action) => {
                let err = match failure {
                    LookupFailure::NoPeers => Error::NoPeers,
                    LookupFailure::Timeout => Error::Timeout,
                    LookupFailure::ValueNotFound => Error::ValueNotFound,
                };
                self.fail_action(action, err);
            }
        }
    }

    fn fail_action(&mut self, action: LookupAction, err: Error) {
        match action {
            LookupAction::Get { resp } => {
                let _ = resp.send(match err {
                    Error::ValueNotFound => Ok(None),
                    e => Err(e),
                });
            }
            LookupAction::Join { resp } => {
                let _ = resp.send(Err(err));
            }
            LookupAction::Set { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            LookupAction::Republish { .. } | LookupAction::Refresh => {
                debug!(error = %err, "background lookup failed");
            }
        }
    }

    // ---- store fan-out ----------------------------------------------------

    fn begin_store_fanout(
        &mut self,
        item: SignedItem,
        contacts: Vec<Contact>,
        resp: Option<oneshot::Sender<Result<StoreReport>>>,
    ) {
        let key = item.key;
        if contacts.is_empty() {
            if let Some(resp) = resp {
                let _ = resp.send(Ok(StoreReport {
                    key,
                    acks: Vec::new(),
                    nacks: Vec::new(),
                }));
            }
            return;
        }
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.store_tasks.insert(
            task_id,
            StoreTask {
                key,
                outstanding: contacts.len(),
                acks: Vec::new(),
                nacks: Vec::new(),
                resp,
            },
        );
        for contact in contacts {
            self.send_request(
                &contact,
                Payload::Store(item.clone()),
                RequestPurpose::StoreOut { task: task_id },
                self.config.request_timeout,
            );
        }
    }

    fn record_store_result(
        &mut self,
        task_id: u64,
        peer: NodeId,
        result: std::result::Result<(), String>,
    ) {
        let Some(task) = self.store_tasks.get_mut(&task_id) else {
            return;
        };
        match result {
            Ok(()) => task.acks.push(peer),
            Err(reason) => task.nacks.push((peer, reason)),
        }
        task.outstanding = task.outstanding.saturating_sub(1);
        if task.outstanding == 0 {
            let task = self.store_tasks.remove(&task_id).expect("task present");
            if let Some(resp) = task.resp {
                let _ = resp.send(Ok(StoreReport {
                    key: task.key,
                    acks: task.acks,
                    nacks: task.nacks,
                }));
            }
        }
    }

    // ---- routing-table upkeep ---------------------------------------------

    /// Offer a contact to the table; a deferred insert triggers a liveness
    /// probe of the bucket head.
    fn observe_contact(&mut self, contact: Contact) {
        let now = self.clock.now();
        if let TableInsert::Deferred { probe } = self.table.insert(contact, now) {
            let already_probing = self.pending.values().any(|p| {
                matches!(&p.purpose, RequestPurpose::Probe { victim } if *victim == probe.id)
            });
            if !already_probing {
                let victim = probe.id;
                self.send_request(
                    &probe,
                    Payload::Ping,
                    RequestPurpose::Probe { victim },
                    self.config.probe_timeout,
                );
            }
        }
    }

    // ---- timers -----------------------------------------------------------

    fn handle_tick(&mut self) {
        let now = self.clock.now();

        // Reap timed-out requests.
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, req)| req.timeout_at <= now)
            .map(|(uuid, _)| *uuid)
            .collect();
        let mut to_drive: Vec<u64> = Vec::new();
        for uuid in expired {
            if let Some(id) = self.note_failure(uuid) {
                if !to_drive.contains(&id) {
                    to_drive.push(id);
                }
            }
        }

        // Enforce lookup deadlines even when nothing timed out.
        for id in self.lookups.keys().copied().collect::<Vec<_>>() {
            if !to_drive.contains(&id) {
                to_drive.push(id);
            }
        }
        for id in to_drive {
            self.drive_lookup(id);
        }
    }

    /// Handle one failed or timed-out request. Returns the lookup that
    /// needs driving, if any.
    fn note_failure(&mut self, uuid: Uuid) -> Option<u64> {
        let now = self.clock.now();
        let request = self.pending.remove(&uuid)?;
        match request.purpose {
            RequestPurpose::Lookup(id) => {
                self.table.record_failure(&request.contact.id, now);
                if let Some(task) = self.lookups.get_mut(&id) {
                    task.state.on_failure(&uuid);
                }
                Some(id)
            }
            RequestPurpose::Probe { victim } => {
                debug!(peer = %victim.short_hex(), "bucket head missed probe, evicting");
                self.table.evict(&victim, now);
                None
            }
            RequestPurpose::StoreOut { task } => {
                self.table.record_failure(&request.contact.id, now);
                self.record_store_result(task, request.contact.id, Err("timeout".into()));
                None
            }
            RequestPurpose::CacheStore => {
                self.table.record_failure(&request.contact.id, now);
                None
            }
        }
    }

    fn handle_maintenance(&mut self) {
        let now = self.clock.now();
        let wall = self.clock.wall_now();

        if let Err(violation) = self.table.check_invariants() {
            debug_assert!(false, "routing table invariant violated: {}", violation);
            error!(%violation, "routing table invariant violated");
        }

        let expired = self.store.expire_scan(wall);
        if expired > 0 {
            debug!(count = expired, "expired items removed");
            self.stats.items_expired += expired as u64;
        }

        // Drop distant caching copies nobody asks for, then republish what
        // remains due.
        let republish_ms = self.config.republish_interval.as_millis() as u64;
        let table = &self.table;
        let pruned = self
            .store
            .prune_cached(now, republish_ms, |key| table.is_far(key));
        self.stats.items_pruned += pruned.len() as u64;

        for key in self.store.republish_due(now, republish_ms) {
            self.store.mark_republished(&key, now);
            if let Some(stored) = self.store.peek(&key).cloned() {
                self.start_lookup(key, LookupKind::Node, LookupAction::Republish { item: stored });
            }
        }

        // Refresh stale buckets with lookups for random ids in their range.
        let refresh_ms = self.config.refresh_interval.as_millis() as u64;
        let targets = self
            .table
            .refresh_targets(now, refresh_ms, &mut thread_rng());
        for target in targets {
            self.start_lookup(target, LookupKind::Node, LookupAction::Refresh);
        }
    }

    fn shutdown(&mut self) {
        info!(id = %self.self_id.short_hex(), "node engine stopping");
        self.pending.clear();
        for (_, task) in self.lookups.drain().collect::<Vec<_>>() {
            self.fail_action(task.action, Error::Cancelled("node leaving".into()));
        }
        for (_, task) in self.store_tasks.drain() {
            if let Some(resp) = task.resp {
                let _ = resp.send(Err(Error::Cancelled("node leaving".into())));
            }
        }
    }

    // ---- outbound ---------------------------------------------------------

    fn send_request(
        &mut self,
        contact: &Contact,
        payload: Payload,
        purpose: RequestPurpose,
        timeout: std::time::Duration,
    ) -> Option<Uuid> {
        let uuid = Uuid::new_v4();
        let env = match Envelope::build(
            &self.keypair,
            uuid,
            self.config.version,
            self.listen_addr.port(),
            payload,
        ) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "failed to build request");
                return None;
            }
        };
        let now = self.clock.now();
        self.pending.insert(
            uuid,
            PendingRequest {
                contact: contact.clone(),
                timeout_at: now + timeout.as_millis() as u64,
                purpose,
            },
        );
        self.queue_frame(contact.address, &env);
        Some(uuid)
    }

    fn reply(&mut self, dest: SocketAddr, uuid: Uuid, payload: Payload) {
        match Envelope::build(
            &self.keypair,
            uuid,
            self.config.version,
            self.listen_addr.port(),
            payload,
        ) {
            Ok(env) => self.queue_frame(dest, &env),
            Err(e) => warn!(error = %e, "failed to build reply"),
        }
    }

    fn send_error(&mut self, dest: SocketAddr, code: ErrorCode, detail: String, original: Uuid) {
        match Envelope::build(
            &self.keypair,
            Uuid::new_v4(),
            self.config.version,
            self.listen_addr.port(),
            Payload::Error {
                code,
                detail,
                original,
            },
        ) {
            Ok(env) => self.queue_frame(dest, &env),
            Err(e) => warn!(error = %e, "failed to build error reply"),
        }
    }

    fn queue_frame(&mut self, dest: SocketAddr, env: &Envelope) {
        match env.encode() {
            Ok(bytes) => {
                self.stats.messages_sent += 1;
                let _ = self.outbound_tx.send((dest, bytes));
            }
            Err(e) => warn!(error = %e, "failed to encode frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use crate::utils::ManualClock;
    use std::time::Duration;

    const WALL: u64 = 1_700_000_000_000;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    struct Harness {
        engine: NodeEngine,
        clock: Arc<ManualClock>,
    }

    fn harness(port: u16) -> Harness {
        let net = MemoryNetwork::new();
        let (transport, inbound) = net.attach(addr(port));
        let clock = Arc::new(ManualClock::new(WALL));
        let (engine, _node) = NodeEngine::new(
            Keypair::from_seed([port as u8; 32]),
            addr(port),
            Config::default(),
            Arc::new(transport),
            inbound,
            clock.clone(),
        )
        .unwrap();
        Harness { engine, clock }
    }

    impl Harness {
        /// Deliver a frame from a fake peer and return the engine's replies.
        fn exchange(&mut self, src: SocketAddr, frame: Vec<u8>) -> Vec<(SocketAddr, Envelope)> {
            self.engine.handle_event(TransportEvent::Datagram {
                source: src,
                frame,
            });
            self.drain()
        }

        fn drain(&mut self) -> Vec<(SocketAddr, Envelope)> {
            let rx = self.engine.outbound_rx.as_mut().unwrap();
            let mut out = Vec::new();
            while let Ok((dest, bytes)) = rx.try_recv() {
                out.push((dest, Envelope::decode(&bytes).unwrap()));
            }
            out
        }
    }

    fn peer_envelope(keypair: &Keypair, reply_port: u16, payload: Payload) -> (Uuid, Vec<u8>) {
        let uuid = Uuid::new_v4();
        let env = Envelope::build(
            keypair,
            uuid,
            crate::protocol::PROTOCOL_VERSION,
            reply_port,
            payload,
        )
        .unwrap();
        (uuid, env.encode().unwrap())
    }

    #[test]
    fn ping_answers_pong_and_records_contact() {
        let mut h = harness(9000);
        let peer = Keypair::from_seed([0xAA; 32]);
        let (uuid, frame) = peer_envelope(&peer, 9500, Payload::Ping);

        let replies = h.exchange(addr(9100), frame);
        assert_eq!(replies.len(), 1);
        let (dest, env) = &replies[0];
        // Reply goes to the advertised reply port, not the source port.
        assert_eq!(*dest, addr(9500));
        assert_eq!(env.uuid, uuid);
        assert!(matches!(env.payload, Payload::Pong));

        let stored = h.engine.table.contact(&peer.node_id()).unwrap();
        assert_eq!(stored.address, addr(9500));
    }

    #[test]
    fn tampered_store_is_rejected_with_bad_signature() {
        let mut h = harness(9001);
        let peer = Keypair::from_seed([0xBB; 32]);
        let mut item = SignedItem::build(
            b"payload".to_vec(),
            "greeting",
            0,
            Vec::new(),
            &peer,
            crate::protocol::PROTOCOL_VERSION,
            WALL,
        )
        .unwrap();
        item.value[0] ^= 0x01;
        let key = item.key;

        let (uuid, frame) = peer_envelope(&peer, 9501, Payload::Store(item));
        let replies = h.exchange(addr(9101), frame);
        assert_eq!(replies.len(), 1);
        match &replies[0].1.payload {
            Payload::StoreErr(e) => assert_eq!(*e, ValidationError::BadSignature),
            other => panic!("expected StoreErr, got {:?}", other),
        }
        assert_eq!(replies[0].1.uuid, uuid);
        assert!(!h.engine.store.contains(&key));
    }

    #[test]
    fn valid_store_then_find_value_round_trips() {
        let mut h = harness(9002);
        let peer = Keypair::from_seed([0xCC; 32]);
        let item = SignedItem::build(
            b"payload".to_vec(),
            "greeting",
            0,
            Vec::new(),
            &peer,
            crate::protocol::PROTOCOL_VERSION,
            WALL,
        )
        .unwrap();
        let key = item.key;

        let (_, frame) = peer_envelope(&peer, 9502, Payload::Store(item.clone()));
        let replies = h.exchange(addr(9102), frame);
        assert!(matches!(replies[0].1.payload, Payload::StoreOk));

        let (_, frame) = peer_envelope(&peer, 9502, Payload::FindValue(key));
        let replies = h.exchange(addr(9102), frame);
        match &replies[0].1.payload {
            Payload::Value(found) => assert_eq!(found.value, item.value),
            other => panic!("expected Value, got {:?}", other),
        }
    }

    #[test]
    fn find_value_falls_back_to_nodes() {
        let mut h = harness(9003);
        let peer = Keypair::from_seed([0xDD; 32]);
        let (_, frame) = peer_envelope(&peer, 9503, Payload::FindValue(NodeId::hash_of(b"absent")));
        let replies = h.exchange(addr(9103), frame);
        match &replies[0].1.payload {
            // Only the requester is known, and it is excluded.
            Payload::Nodes(peers) => assert!(peers.is_empty()),
            other => panic!("expected Nodes, got {:?}", other),
        }
    }

    #[test]
    fn invalid_version_gets_error_and_no_table_entry() {
        let mut h = harness(9004);
        let peer = Keypair::from_seed([0xEE; 32]);
        let uuid = Uuid::new_v4();
        let env = Envelope::build(
            &peer,
            uuid,
            crate::protocol::PROTOCOL_VERSION + 9,
            9504,
            Payload::Ping,
        )
        .unwrap();

        let replies = h.exchange(addr(9104), env.encode().unwrap());
        assert_eq!(replies.len(), 1);
        match &replies[0].1.payload {
            Payload::Error { code, original, .. } => {
                assert_eq!(*code, ErrorCode::Version);
                assert_eq!(*original, uuid);
            }
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(h.engine.table.contact(&peer.node_id()).is_none());
    }

    #[test]
    fn request_timeouts_bump_failures_and_evict() {
        let mut h = harness(9005);
        let peer = Keypair::from_seed([0x11; 32]);
        let contact = Contact::new(peer.node_id(), addr(9505), 1, 0);
        h.engine.observe_contact(contact.clone());
        assert!(h.engine.table.contact(&contact.id).is_some());

        // Three successive unanswered requests evict the contact.
        for _ in 0..3 {
            h.engine.send_request(
                &contact,
                Payload::Ping,
                RequestPurpose::CacheStore,
                Duration::from_millis(100),
            );
            h.clock.advance(Duration::from_millis(200));
            h.engine.handle_tick();
        }
        assert!(h.engine.table.contact(&contact.id).is_none());
    }

    #[test]
    fn unreachable_bucket_head_is_evicted_after_probe_timeout() {
        let mut h = harness(9007);
        let self_first_bit = h.engine.self_id.bit(0);
        let mut rng = rand::thread_rng();

        // Fill the unsplittable far half of the keyspace to capacity.
        let far_id = |rng: &mut rand::rngs::ThreadRng| {
            NodeId::random(rng).with_bit(0, !self_first_bit)
        };
        let mut ids = Vec::new();
        for i in 0..h.engine.config.k {
            let id = far_id(&mut rng);
            ids.push(id);
            h.engine
                .observe_contact(Contact::new(id, addr(10_000 + i as u16), 1, 0));
        }
        let head = ids[0];

        // One more candidate defers and probes the stale head.
        let newcomer = far_id(&mut rng);
        h.engine
            .observe_contact(Contact::new(newcomer, addr(10_100), 1, 0));
        assert!(h
            .engine
            .pending
            .values()
            .any(|p| matches!(&p.purpose, RequestPurpose::Probe { victim } if *victim == head)));

        // The head never answers: it is evicted and the candidate promoted.
        h.clock.advance(Duration::from_millis(600));
        h.engine.handle_tick();
        assert!(h.engine.table.contact(&head).is_none());
        assert!(h.engine.table.contact(&newcomer).is_some());
        assert_eq!(h.engine.table.len(), h.engine.config.k);
    }

    #[test]
    fn expired_items_are_scanned_out() {
        let mut h = harness(9006);
        let peer = Keypair::from_seed([0x22; 32]);
        let item = SignedItem::build(
            b"v".to_vec(),
            "mortal",
            WALL + 1_000,
            Vec::new(),
            &peer,
            crate::protocol::PROTOCOL_VERSION,
            WALL,
        )
        .unwrap();
        let key = item.key;
        let (_, frame) = peer_envelope(&peer, 9506, Payload::Store(item));
        h.exchange(addr(9106), frame);
        assert!(h.engine.store.contains(&key));

        h.clock.advance(Duration::from_secs(2));
        h.engine.handle_maintenance();
        assert!(!h.engine.store.contains(&key));
        assert_eq!(h.engine.stats.items_expired, 1);
    }
}
