//! # Node
//!
//! The `Node` is one simulated participant. It owns the peer registry and
//! the listener, holds the ledger and consensus handles, and remembers the
//! last slot it forged in.
//!
//! ```text
//! new() -> listen() -> connect_peers() -> [serving + forging] -> shutdown()
//! ```
//!
//! Inbound traffic from every connection funnels into
//! [`Node::process_message`]; outbound traffic leaves through
//! [`Node::broadcast`].

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{accept_loop, spawn_connection_handler};
use super::error::NodeError;
use super::message::Message;
use super::peer::{Connection, Peer};
use super::registry::PeerRegistry;
use crate::config::{NodeConfig, NodeId};
use crate::consensus::{ConsensusEngine, Pbft};
use crate::stats::{NodeStats, StatsSnapshot};
use crate::storage::{Block, Blockchain, Ledger};
use crate::time::{Slot, SlotClock};

// ---------------------------------------------------------------------------
// Dispatch outcomes
// ---------------------------------------------------------------------------

/// What [`Node::process_message`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// `Init` registered a new peer on the receiving connection.
    PeerRegistered,
    /// `Init` for a peer that is already registered.
    PeerAlreadyKnown,
    /// `Init` carrying our own ID.
    SelfHandshake,
    /// New, valid block: re-broadcast and handed to consensus.
    BlockRelayed,
    /// Block already held by the ledger.
    BlockDuplicate,
    /// Block failed ledger validation and was dropped.
    BlockRejected,
    /// Stage message passed to the consensus engine.
    StageForwarded,
}

/// Result of one broadcast, available once every per-peer send finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<NodeId>,
    pub pruned: Vec<NodeId>,
}

/// Result of [`Node::connect_peers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A participant in the simulated DPoS network.
pub struct Node {
    /// Unique node identifier in `[0, number_of_peers)`.
    pub id: NodeId,
    config: NodeConfig,
    registry: PeerRegistry,
    chain: Arc<dyn Ledger>,
    consensus: Arc<dyn ConsensusEngine>,
    clock: SlotClock,
    last_forged_slot: Mutex<Option<Slot>>,
    /// Serializes the has-block check with the consensus hand-off.
    block_gate: Mutex<()>,
    stats: NodeStats,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("peers", &self.registry.ids())
            .field("last_forged_slot", &*self.last_forged_slot.lock())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        chain: Arc<dyn Ledger>,
        consensus: Arc<dyn ConsensusEngine>,
        clock: SlotClock,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        info!(node_id = id, "creating node");
        Arc::new(Self {
            id,
            config,
            registry: PeerRegistry::new(),
            chain,
            consensus,
            clock,
            last_forged_slot: Mutex::new(None),
            block_gate: Mutex::new(()),
            stats: NodeStats::default(),
            shutdown_tx,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn chain(&self) -> &Arc<dyn Ledger> {
        &self.chain
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusEngine> {
        &self.consensus
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &NodeStats {
        &self.stats
    }

    pub fn last_forged_slot(&self) -> Option<Slot> {
        *self.last_forged_slot.lock()
    }

    /// Marks `slot` as forged. Returns `false` if it already was.
    pub(crate) fn claim_forging_slot(&self, slot: Slot) -> bool {
        let mut last = self.last_forged_slot.lock();
        if *last == Some(slot) {
            return false;
        }
        *last = Some(slot);
        true
    }

    /// Address the listener is bound to, once [`listen`](Self::listen) ran.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// A receiver that flips to `true` when the node shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Binds `listen_host:(base_port + id)` and starts accepting.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let addr = self.config.listen_addr(self.id);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        *self.local_addr.lock() = Some(local);
        info!(node_id = self.id, %local, "listening for peers");

        let handle = tokio::spawn(accept_loop(Arc::clone(self), listener, self.shutdown_signal()));
        self.track(handle);
        Ok(local)
    }

    /// Drains consensus output into [`broadcast`](Self::broadcast) until
    /// shutdown.
    pub fn spawn_outbound_relay(self: &Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Message>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    next = outbound.recv() => match next {
                        Some(msg) => {
                            node.broadcast(msg);
                        }
                        None => break,
                    },
                }
            }
            debug!(node_id = node.id, "consensus relay stopped");
        });
        self.track(handle);
    }

    /// Dials up to `number_of_peers` random candidates.
    ///
    /// Candidates are drawn with replacement from `[0, number_of_peers)`;
    /// self and already-registered IDs are skipped. The resulting graph is
    /// random and not necessarily symmetric.
    pub async fn connect_peers(self: &Arc<Self>) -> ConnectReport {
        let n = self.config.number_of_peers;
        let candidates: Vec<NodeId> = {
            let mut rng = rand::thread_rng();
            (0..n).map(|_| rng.gen_range(0..n)).collect()
        };

        let mut report = ConnectReport::default();
        for candidate in candidates {
            if candidate == self.id || self.registry.contains(candidate) {
                continue;
            }
            if self.is_shutting_down() {
                break;
            }
            match self.dial(candidate).await {
                Ok(()) => report.connected.push(candidate),
                Err(e) => {
                    warn!(node_id = self.id, peer_id = candidate, error = %e, "could not reach peer");
                    NodeStats::incr(&self.stats.dial_failures);
                    report.failed.push(candidate);
                }
            }
        }

        info!(
            node_id = self.id,
            connected = report.connected.len(),
            failed = report.failed.len(),
            peers = self.registry.len(),
            "peer bootstrap finished"
        );
        report
    }

    /// Dials one peer, starts receiving on the new stream and registers it.
    pub async fn dial(self: &Arc<Self>, peer_id: NodeId) -> Result<(), NodeError> {
        let addr = self.config.listen_addr(peer_id);
        let (peer, reader) = Peer::connect(peer_id, self.id, &addr, &self.config).await?;
        self.track(spawn_connection_handler(self, reader, Arc::clone(peer.connection())));

        if !self.registry.insert_dialed(peer) {
            // A handshake from the same peer won the race; its connection
            // stays the registered one and ours keeps receiving.
            debug!(node_id = self.id, peer_id, "peer registered by handshake meanwhile");
        }
        Ok(())
    }

    /// Signals every loop to stop, closes all peer connections and waits
    /// for the listener and relay tasks.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(node_id = self.id, "shutting down node");

        for peer in self.registry.drain() {
            peer.connection().close().await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node_id = self.id, error = %e, "node task ended abnormally");
            }
        }
        info!(node_id = self.id, "node stopped");
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Routes one decoded message. `conn` is the connection it arrived on.
    pub fn process_message(self: &Arc<Self>, msg: Message, conn: &Arc<Connection>) -> Dispatch {
        match msg {
            Message::Init(peer_id) => self.handle_handshake(peer_id, conn),
            Message::Block(block) => self.handle_block(block),
            Message::Stage(stage) => {
                NodeStats::incr(&self.stats.stage_messages);
                self.consensus.process_stage_message(stage);
                Dispatch::StageForwarded
            }
        }
    }

    fn handle_handshake(&self, peer_id: NodeId, conn: &Arc<Connection>) -> Dispatch {
        if peer_id == self.id {
            warn!(node_id = self.id, remote = %conn.remote(), "received handshake with our own id");
            return Dispatch::SelfHandshake;
        }

        let peer = Peer::new(peer_id, self.id, Arc::clone(conn));
        if self.registry.insert_if_absent(peer) {
            NodeStats::incr(&self.stats.handshakes);
            info!(node_id = self.id, peer_id, remote = %conn.remote(), "registered peer from handshake");
            Dispatch::PeerRegistered
        } else {
            debug!(node_id = self.id, peer_id, "handshake from known peer");
            Dispatch::PeerAlreadyKnown
        }
    }

    fn handle_block(self: &Arc<Self>, block: Block) -> Dispatch {
        let _gate = self.block_gate.lock();

        if self.chain.has_block(&block.hash) {
            NodeStats::incr(&self.stats.blocks_duplicate);
            return Dispatch::BlockDuplicate;
        }
        if !self.chain.validate_block(&block) {
            NodeStats::incr(&self.stats.blocks_rejected);
            debug!(node_id = self.id, hash = %block.short_hash(), "dropping invalid block");
            return Dispatch::BlockRejected;
        }

        let slot = self.clock.slot_of(block.timestamp);
        debug!(node_id = self.id, slot, hash = %block.short_hash(), "relaying block");
        self.broadcast(Message::block(block.clone()));
        self.consensus.add_block(&block, slot);
        NodeStats::incr(&self.stats.blocks_relayed);
        Dispatch::BlockRelayed
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Sends `msg` to every registered peer without waiting.
    ///
    /// Each peer gets its own send task with bounded retry. Peers whose
    /// consecutive failures reach `max_peer_failures` are pruned. The
    /// returned handle resolves to the aggregate report; dropping it is fine.
    pub fn broadcast(self: &Arc<Self>, msg: Message) -> JoinHandle<BroadcastReport> {
        let kind = msg.kind();
        let frame = match msg.encode_frame(self.config.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id = self.id, kind, error = %e, "cannot encode broadcast");
                return tokio::spawn(async { BroadcastReport::default() });
            }
        };

        let peers = self.registry.snapshot();
        debug!(node_id = self.id, kind, peers = peers.len(), "broadcasting");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let sends: Vec<_> = peers
                .into_iter()
                .map(|peer| {
                    let node = Arc::clone(&node);
                    let frame = frame.clone();
                    tokio::spawn(async move {
                        let result = peer.send_frame_with_retry(&frame, &node.config).await;
                        (peer, result)
                    })
                })
                .collect();

            let mut report = BroadcastReport::default();
            for joined in futures::future::join_all(sends).await {
                match joined {
                    Ok((_, Ok(()))) => report.delivered += 1,
                    Ok((peer, Err(_))) => {
                        NodeStats::incr(&node.stats.send_failures);
                        report.failed.push(peer.id);
                        if peer.failures() >= node.config.max_peer_failures && node.prune(&peer).await {
                            report.pruned.push(peer.id);
                        }
                    }
                    Err(e) => warn!(node_id = node.id, error = %e, "send task panicked"),
                }
            }
            report
        })
    }

    /// Removes a peer and closes its connection. Returns `false` if the
    /// registry no longer held this peer on this connection.
    pub(crate) async fn prune(&self, peer: &Peer) -> bool {
        let conn = peer.connection();
        match self.registry.remove_if_connection(peer.id, conn.id()) {
            Some(_) => {
                conn.close().await;
                NodeStats::incr(&self.stats.peers_pruned);
                info!(node_id = self.id, peer_id = peer.id, failures = peer.failures(), "pruned unreachable peer");
                true
            }
            None => false,
        }
    }

    /// Drops registry entries bound to a connection that ended.
    pub(crate) fn forget_connection(&self, conn: &Connection) {
        for peer in self.registry.snapshot() {
            if peer.connection().id() == conn.id()
                && self.registry.remove_if_connection(peer.id, conn.id()).is_some()
            {
                info!(node_id = self.id, peer_id = peer.id, "peer disconnected, removed from registry");
            }
        }
    }
}

/// Resolves once the shutdown flag is `true` or the sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// LocalNode
// ---------------------------------------------------------------------------

/// A node wired to the in-memory ledger and the PBFT engine, listening.
pub struct LocalNode {
    pub node: Arc<Node>,
    pub chain: Arc<Blockchain>,
    pub consensus: Arc<Pbft>,
}

impl LocalNode {
    /// Validates `config`, builds the collaborators, binds the listener and
    /// starts the consensus relay. Peers are not dialed yet.
    pub async fn start(id: NodeId, config: NodeConfig, clock: SlotClock) -> Result<Self, NodeError> {
        config.validate()?;

        let chain = Arc::new(Blockchain::new(id, clock.clone(), config.number_of_delegates));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let consensus = Arc::new(Pbft::new(
            id,
            config.number_of_peers,
            Arc::clone(&chain),
            outbound_tx,
        ));
        let node = Node::new(
            id,
            config,
            Arc::clone(&chain) as Arc<dyn Ledger>,
            Arc::clone(&consensus) as Arc<dyn ConsensusEngine>,
            clock,
        );

        node.listen().await?;
        node.spawn_outbound_relay(outbound_rx);

        Ok(Self {
            node,
            chain,
            consensus,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
