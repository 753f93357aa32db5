//! In-memory ledger.
//!
//! [`Ledger`] is the surface the networking core consumes. [`Blockchain`]
//! implements it with a committed chain plus a pool of pending blocks that
//! have been seen (forged locally or received) but not yet finalized by the
//! consensus engine. `has_block` answers for both, and keeps answering for
//! pending blocks that lost their height to a commit, which is what bounds
//! gossip to one relay per block.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::block::{Block, BlockHash};
use crate::config::{NodeId, MAX_CLOCK_SKEW};
use crate::time::SlotClock;

/// Ledger operations used by the node.
pub trait Ledger: Send + Sync {
    /// Tip of the committed chain.
    fn get_last_block(&self) -> Block;
    /// Forge a block on top of the committed tip.
    fn create_block(&self) -> Block;
    /// Whether the block is committed or pending.
    fn has_block(&self, hash: &BlockHash) -> bool;
    /// Whether the block may be relayed and proposed.
    fn validate_block(&self, block: &Block) -> bool;
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<Block>,
    index: HashMap<BlockHash, usize>,
    pending: HashMap<BlockHash, Block>,
    discarded: HashSet<BlockHash>,
}

impl ChainState {
    fn tip(&self) -> &Block {
        // `new` always pushes genesis.
        &self.blocks[self.blocks.len() - 1]
    }
}

/// Outcome of [`Blockchain::commit_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block became the new tip.
    Committed,
    /// Already part of the committed chain.
    AlreadyCommitted,
    /// The block was never staged.
    Unknown,
    /// The block does not extend the current tip.
    NotOnTip,
}

/// Ordered chain of committed blocks plus pending proposals.
#[derive(Debug)]
pub struct Blockchain {
    node_id: NodeId,
    number_of_delegates: u64,
    clock: SlotClock,
    state: RwLock<ChainState>,
}

impl Blockchain {
    /// Creates a chain holding only the genesis block.
    pub fn new(node_id: NodeId, clock: SlotClock, number_of_delegates: u64) -> Self {
        let genesis = Block::genesis(clock.epoch_ms());
        let mut state = ChainState::default();
        state.index.insert(genesis.hash, 0);
        state.blocks.push(genesis);

        Self {
            node_id,
            number_of_delegates: number_of_delegates.max(1),
            clock,
            state: RwLock::new(state),
        }
    }

    /// Adds a block to the pending pool. Returns `false` if it was already known.
    pub fn stage_block(&self, block: Block) -> bool {
        let mut state = self.state.write();
        if state.index.contains_key(&block.hash)
            || state.pending.contains_key(&block.hash)
            || state.discarded.contains(&block.hash)
        {
            return false;
        }
        state.pending.insert(block.hash, block);
        true
    }

    /// Moves a pending block onto the chain if it extends the tip.
    ///
    /// On success, pending blocks at or below the new height are discarded:
    /// they can no longer extend the chain. Their hashes stay known.
    pub fn commit_block(&self, hash: &BlockHash) -> CommitOutcome {
        let mut state = self.state.write();
        if state.index.contains_key(hash) {
            return CommitOutcome::AlreadyCommitted;
        }
        let Some(block) = state.pending.get(hash) else {
            return CommitOutcome::Unknown;
        };
        if block.parent_hash != state.tip().hash {
            warn!(
                node_id = self.node_id,
                height = block.height,
                hash = %block.short_hash(),
                "finalized block does not extend the tip"
            );
            return CommitOutcome::NotOnTip;
        }

        let Some(block) = state.pending.remove(hash) else {
            return CommitOutcome::Unknown;
        };
        let height = block.height;
        info!(node_id = self.node_id, height, hash = %block.short_hash(), "block committed");

        let position = state.blocks.len();
        state.index.insert(block.hash, position);
        state.blocks.push(block);
        let stale: Vec<BlockHash> = state
            .pending
            .values()
            .filter(|b| b.height <= height)
            .map(|b| b.hash)
            .collect();
        for hash in stale {
            state.pending.remove(&hash);
            state.discarded.insert(hash);
        }
        CommitOutcome::Committed
    }

    /// Number of committed blocks, genesis included.
    pub fn height(&self) -> u64 {
        self.state.read().blocks.len() as u64
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn is_committed(&self, hash: &BlockHash) -> bool {
        self.state.read().index.contains_key(hash)
    }

    fn reject(&self, block: &Block, reason: &str) -> bool {
        debug!(
            node_id = self.node_id,
            hash = %block.short_hash(),
            generator = block.generator,
            reason,
            "block failed validation"
        );
        false
    }
}

impl Ledger for Blockchain {
    fn get_last_block(&self) -> Block {
        self.state.read().tip().clone()
    }

    fn create_block(&self) -> Block {
        let mut state = self.state.write();
        let block = Block::new(state.tip(), self.node_id, self.clock.now_ms());
        state.pending.insert(block.hash, block.clone());
        block
    }

    fn has_block(&self, hash: &BlockHash) -> bool {
        let state = self.state.read();
        state.index.contains_key(hash)
            || state.pending.contains_key(hash)
            || state.discarded.contains(hash)
    }

    fn validate_block(&self, block: &Block) -> bool {
        if !block.is_intact() {
            return self.reject(block, "hash mismatch");
        }

        let (parent_height, tip_height) = {
            let state = self.state.read();
            match state.index.get(&block.parent_hash) {
                Some(&position) => (state.blocks[position].height, state.tip().height),
                None => return self.reject(block, "unknown parent"),
            }
        };
        if block.height != parent_height + 1 {
            return self.reject(block, "height does not follow parent");
        }
        if block.height <= tip_height {
            return self.reject(block, "height already committed");
        }

        let slot = self.clock.slot_of(block.timestamp);
        if block.generator != slot % self.number_of_delegates {
            return self.reject(block, "generator is not the slot delegate");
        }

        let horizon = self.clock.now_ms() + MAX_CLOCK_SKEW.as_millis() as u64;
        if block.timestamp > horizon {
            return self.reject(block, "timestamp in the future");
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::time::ManualTimeSource;

    const EPOCH: u64 = 10_000;
    const SLOT: u64 = 1_000;

    fn chain_at(node_id: NodeId, now_ms: u64) -> (Blockchain, Arc<ManualTimeSource>) {
        let source = Arc::new(ManualTimeSource::new(now_ms));
        let clock = SlotClock::with_source(EPOCH, SLOT, source.clone());
        (Blockchain::new(node_id, clock, 2), source)
    }

    fn slot_time(slot: u64) -> u64 {
        EPOCH + slot * SLOT + 10
    }

    #[test]
    fn starts_with_genesis() {
        let (chain, _) = chain_at(0, EPOCH);
        assert_eq!(chain.height(), 1);
        let tip = chain.get_last_block();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.timestamp, EPOCH);
        assert!(chain.has_block(&tip.hash));
    }

    #[test]
    fn created_block_is_pending_and_valid() {
        let (chain, _) = chain_at(0, slot_time(42));
        let block = chain.create_block();
        assert_eq!(block.height, 1);
        assert_eq!(block.generator, 0);
        assert!(chain.has_block(&block.hash));
        assert!(!chain.is_committed(&block.hash));
        assert!(chain.validate_block(&block));
    }

    #[test]
    fn rejects_wrong_delegate() {
        let (producer, _) = chain_at(1, slot_time(42));
        let block = producer.create_block();
        let (verifier, _) = chain_at(0, slot_time(42));
        assert!(!verifier.validate_block(&block));
    }

    #[test]
    fn rejects_tampered_and_orphan_blocks() {
        let (chain, _) = chain_at(0, slot_time(42));
        let mut tampered = chain.create_block();
        tampered.timestamp += 1;
        assert!(!chain.validate_block(&tampered));

        let orphan_parent = Block::new(&Block::genesis(EPOCH), 0, slot_time(40));
        let orphan = Block::new(&orphan_parent, 0, slot_time(42));
        assert!(!chain.validate_block(&orphan));
    }

    #[test]
    fn rejects_future_timestamp() {
        let (producer, _) = chain_at(0, slot_time(44));
        let block = producer.create_block();
        let (verifier, _) = chain_at(1, slot_time(42));
        assert!(!verifier.validate_block(&block));
    }

    #[test]
    fn commit_extends_tip_and_drops_stale_pending() {
        let (chain, source) = chain_at(0, slot_time(42));
        let first = chain.create_block();
        source.set(slot_time(44));
        let competing = chain.create_block();
        assert_eq!(chain.pending_count(), 2);

        assert_eq!(chain.commit_block(&first.hash), CommitOutcome::Committed);
        assert_eq!(chain.get_last_block(), first);
        assert_eq!(chain.pending_count(), 0);
        assert_eq!(chain.commit_block(&first.hash), CommitOutcome::AlreadyCommitted);
        assert_eq!(chain.commit_block(&competing.hash), CommitOutcome::Unknown);
    }

    #[test]
    fn discarded_fork_block_stays_known_and_invalid() {
        let (chain, source) = chain_at(0, slot_time(42));
        let winner = chain.create_block();
        source.set(slot_time(44));
        let stale = chain.create_block();
        assert_eq!(chain.commit_block(&winner.hash), CommitOutcome::Committed);

        assert!(chain.has_block(&stale.hash));
        assert!(!chain.stage_block(stale.clone()));
        assert!(!chain.validate_block(&stale));
    }

    #[test]
    fn commit_requires_staged_block_on_tip() {
        let (chain, _) = chain_at(0, slot_time(42));
        assert_eq!(chain.commit_block(&[7u8; 32]), CommitOutcome::Unknown);

        let first = chain.create_block();
        let second = Block::new(&first, 0, slot_time(44));
        assert!(chain.stage_block(second.clone()));
        assert!(!chain.stage_block(second.clone()));
        assert_eq!(chain.commit_block(&second.hash), CommitOutcome::NotOnTip);
    }
}
