//! # PBFT Stage Engine
//!
//! A compact two-phase agreement run per `(slot, block hash)`:
//!
//! 1. **Prepare** - a node that accepts a block votes `PREPARE` for it.
//! 2. **Commit** - once a node has seen a prepare quorum for a block it
//!    holds, it votes `COMMIT`.
//! 3. A commit quorum finalizes the block into the ledger.
//!
//! Votes are gossiped: every vote seen for the first time is re-emitted, so
//! votes from nodes that are not direct peers still arrive. Duplicate votes
//! are dropped on the `(stage, voter)` sets, which bounds the fan-out.
//!
//! Quorum is `2 * participants / 3 + 1`. There is no view change and no
//! leader timeout; a block that never reaches quorum simply stays pending
//! until the chain moves past its height.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::ConsensusEngine;
use crate::config::NodeId;
use crate::network::message::{Message, StageMessage};
use crate::storage::{Block, BlockHash, Blockchain, CommitOutcome};
use crate::time::Slot;

/// Stage tag of prepare votes.
pub const STAGE_PREPARE: u8 = 1;
/// Stage tag of commit votes.
pub const STAGE_COMMIT: u8 = 2;

/// How many slots of vote bookkeeping survive a commit.
const ROUND_RETENTION: Slot = 16;

/// Payload of a stage message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub slot: Slot,
    pub block_hash: BlockHash,
    pub voter: NodeId,
}

impl Vote {
    pub fn to_stage_message(&self, stage: u8) -> Message {
        // Serializing a fixed-size struct into a Vec cannot fail.
        let payload = bincode::serialize(self).unwrap_or_default();
        Message::stage(stage, payload)
    }
}

#[derive(Debug, Default)]
struct Round {
    has_block: bool,
    prepares: HashSet<NodeId>,
    commits: HashSet<NodeId>,
    sent_commit: bool,
    finalized: bool,
}

/// PBFT-style consensus engine for one node.
pub struct Pbft {
    node_id: NodeId,
    quorum: usize,
    chain: Arc<Blockchain>,
    outbound: mpsc::UnboundedSender<Message>,
    rounds: DashMap<(Slot, BlockHash), Round>,
    finalized: AtomicU64,
}

impl Pbft {
    /// `participants` is the number of voting nodes. Messages the engine
    /// wants broadcast are pushed to `outbound`.
    pub fn new(
        node_id: NodeId,
        participants: u64,
        chain: Arc<Blockchain>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            node_id,
            quorum: quorum_for(participants),
            chain,
            outbound,
            rounds: DashMap::new(),
            finalized: AtomicU64::new(0),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Blocks this engine has finalized into the ledger.
    pub fn finalized_count(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Prepare and commit vote counts for a round.
    pub fn vote_counts(&self, slot: Slot, hash: &BlockHash) -> (usize, usize) {
        self.rounds
            .get(&(slot, *hash))
            .map(|r| (r.prepares.len(), r.commits.len()))
            .unwrap_or((0, 0))
    }

    fn emit(&self, msg: Message) {
        if self.outbound.send(msg).is_err() {
            debug!(node_id = self.node_id, "consensus outbound channel closed");
        }
    }

    /// Records a vote and advances the round. Returns the finalized slot if
    /// this vote completed the commit quorum.
    fn apply(&self, stage: u8, vote: Vote, has_block: bool) -> Option<Slot> {
        let mut round = self.rounds.entry((vote.slot, vote.block_hash)).or_default();
        round.has_block |= has_block;

        let fresh = match stage {
            STAGE_PREPARE => round.prepares.insert(vote.voter),
            STAGE_COMMIT => round.commits.insert(vote.voter),
            _ => false,
        };
        if fresh {
            trace!(node_id = self.node_id, stage, voter = vote.voter, slot = vote.slot, "vote recorded");
            self.emit(vote.to_stage_message(stage));
        }

        if round.has_block && !round.sent_commit && round.prepares.len() >= self.quorum {
            round.sent_commit = true;
            let own = Vote {
                voter: self.node_id,
                ..vote
            };
            if round.commits.insert(self.node_id) {
                self.emit(own.to_stage_message(STAGE_COMMIT));
            }
        }

        if round.has_block && !round.finalized && round.commits.len() >= self.quorum {
            match self.chain.commit_block(&vote.block_hash) {
                CommitOutcome::Committed | CommitOutcome::AlreadyCommitted => {
                    round.finalized = true;
                    self.finalized.fetch_add(1, Ordering::Relaxed);
                    return Some(vote.slot);
                }
                outcome => {
                    debug!(node_id = self.node_id, slot = vote.slot, ?outcome, "commit quorum reached but block not committable");
                }
            }
        }
        None
    }

    fn prune_before(&self, slot: Slot) {
        self.rounds
            .retain(|(round_slot, _), _| round_slot + ROUND_RETENTION >= slot);
    }
}

impl ConsensusEngine for Pbft {
    fn add_block(&self, block: &Block, slot: Slot) {
        self.chain.stage_block(block.clone());
        let vote = Vote {
            slot,
            block_hash: block.hash,
            voter: self.node_id,
        };
        if let Some(done) = self.apply(STAGE_PREPARE, vote, true) {
            self.prune_before(done);
        }
    }

    fn process_stage_message(&self, msg: StageMessage) {
        if msg.stage != STAGE_PREPARE && msg.stage != STAGE_COMMIT {
            warn!(node_id = self.node_id, stage = msg.stage, "unknown consensus stage, dropping");
            return;
        }
        let vote: Vote = match bincode::deserialize(&msg.payload) {
            Ok(vote) => vote,
            Err(e) => {
                warn!(node_id = self.node_id, error = %e, "undecodable stage payload, dropping");
                return;
            }
        };
        if let Some(done) = self.apply(msg.stage, vote, false) {
            info!(node_id = self.node_id, slot = done, "block finalized");
            self.prune_before(done);
        }
    }
}

/// Smallest vote count that is more than two thirds of `participants`.
pub fn quorum_for(participants: u64) -> usize {
    (2 * participants / 3 + 1) as usize
}
