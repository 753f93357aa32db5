//! # Slot Forging Scheduler
//!
//! Polls the slot clock and forges when this node is the delegate for the
//! current slot. Each tick:
//!
//! 1. If the chain tip already belongs to the current slot, do nothing.
//! 2. If this node already forged in the current slot, do nothing.
//! 3. If `slot % number_of_delegates` is not this node's ID, do nothing.
//! 4. Otherwise create a block, broadcast it, hand it to consensus and
//!    record the slot.
//!
//! Steps 2 and 4 share one lock, so a node forges at most once per slot
//! even if two ticks race.
//!
//! Between ticks the loop sleeps `poll_interval` after steps 1 and 2 and
//! `forge_cooldown` after steps 3 and 4.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::message::Message;
use super::node::{shutdown_requested, Node};
use crate::config::NodeId;
use crate::stats::NodeStats;
use crate::storage::Block;
use crate::time::Slot;

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgeOutcome {
    /// The chain tip was forged in the current slot.
    ChainCurrent,
    /// This node already forged in the current slot.
    AlreadyForged,
    /// Another delegate owns the current slot.
    NotDelegate { delegate: NodeId },
    /// A block was forged and handed off.
    Forged(Block),
}

/// Drives block production for one node.
pub struct ForgingScheduler {
    node: Arc<Node>,
}

impl ForgingScheduler {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Spawns [`run`](Self::run) on the node's shutdown signal.
    pub fn spawn(node: &Arc<Node>) -> tokio::task::JoinHandle<()> {
        let scheduler = Self::new(Arc::clone(node));
        let shutdown = node.shutdown_signal();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }

    /// Ticks until shutdown is signalled.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let node_id = self.node.id;
        info!(node_id, "forging scheduler starting");

        loop {
            let outcome = self.tick();
            let pause = self.pause_after(&outcome);

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(node_id, "forging scheduler stopped");
    }

    /// Runs one check against the current slot.
    pub fn tick(&self) -> ForgeOutcome {
        self.tick_at(self.node.clock().current_slot())
    }

    /// Runs one check as if `current_slot` were now.
    pub fn tick_at(&self, current_slot: Slot) -> ForgeOutcome {
        let node = &self.node;
        let clock = node.clock();

        let tip = node.chain().get_last_block();
        if clock.slot_of(tip.timestamp) == current_slot {
            return ForgeOutcome::ChainCurrent;
        }

        let delegate = node.config().delegate_for_slot(current_slot);
        if node.last_forged_slot() == Some(current_slot) {
            return ForgeOutcome::AlreadyForged;
        }
        if delegate != node.id {
            debug!(node_id = node.id, slot = current_slot, delegate, "not our slot");
            return ForgeOutcome::NotDelegate { delegate };
        }
        if !node.claim_forging_slot(current_slot) {
            return ForgeOutcome::AlreadyForged;
        }

        let block = node.chain().create_block();
        let block_slot = clock.slot_of(block.timestamp);
        info!(
            node_id = node.id,
            slot = current_slot,
            height = block.height,
            hash = %block.short_hash(),
            "forged block"
        );

        node.broadcast(Message::block(block.clone()));
        node.consensus().add_block(&block, block_slot);
        NodeStats::incr(&node.counters().blocks_forged);

        ForgeOutcome::Forged(block)
    }

    fn pause_after(&self, outcome: &ForgeOutcome) -> Duration {
        let config = self.node.config();
        match outcome {
            ForgeOutcome::ChainCurrent | ForgeOutcome::AlreadyForged => config.poll_interval,
            ForgeOutcome::NotDelegate { .. } | ForgeOutcome::Forged(_) => config.forge_cooldown,
        }
    }
}
