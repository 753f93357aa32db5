//! # Consensus Module
//!
//! The node hands every accepted block and every consensus-stage message to
//! a [`ConsensusEngine`]. The network layer never looks inside stage
//! payloads; their meaning belongs to the engine.
//!
//! ```text
//! pbft.rs - two-phase prepare/commit agreement over gossiped votes
//! ```

pub mod pbft;

pub use pbft::{Pbft, Vote, STAGE_COMMIT, STAGE_PREPARE};

use crate::network::message::StageMessage;
use crate::storage::Block;
use crate::time::Slot;

/// Agreement protocol deciding block finality.
pub trait ConsensusEngine: Send + Sync {
    /// A block this node forged or accepted from gossip, tagged with the
    /// slot derived from its timestamp.
    fn add_block(&self, block: &Block, slot: Slot);

    /// A stage message received from a peer, passed through unopened.
    fn process_stage_message(&self, msg: StageMessage);
}
