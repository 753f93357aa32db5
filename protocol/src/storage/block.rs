//! # Block Structure
//!
//! A block is the unit the ledger commits. The networking core only looks
//! at two fields: `hash` for duplicate detection and `timestamp` for slot
//! derivation. The rest exists so the in-memory ledger can link and check
//! blocks.
//!
//! ## Hash Computation
//!
//! The block hash is `BLAKE3(height || parent_hash || timestamp || generator)`
//! with integers encoded little-endian.

use serde::{Deserialize, Serialize};

use crate::config::NodeId;

/// 32-byte BLAKE3 digest identifying a block.
pub type BlockHash = [u8; 32];

/// A forged block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height (genesis = 0).
    pub height: u64,
    /// BLAKE3 hash of the other header fields.
    pub hash: BlockHash,
    /// Hash of the parent block. All zeros for genesis.
    pub parent_hash: BlockHash,
    /// Unix timestamp (milliseconds) at which the block was forged.
    pub timestamp: u64,
    /// Delegate that forged this block.
    pub generator: NodeId,
}

impl Block {
    /// The genesis block, stamped with the chain epoch so that it sits in
    /// slot 0.
    pub fn genesis(epoch_ms: u64) -> Self {
        Self::assemble(0, [0u8; 32], epoch_ms, 0)
    }

    /// Build a block extending `parent`.
    pub fn new(parent: &Block, generator: NodeId, timestamp: u64) -> Self {
        Self::assemble(parent.height + 1, parent.hash, timestamp, generator)
    }

    fn assemble(height: u64, parent_hash: BlockHash, timestamp: u64, generator: NodeId) -> Self {
        Block {
            height,
            hash: compute_hash(height, &parent_hash, timestamp, generator),
            parent_hash,
            timestamp,
            generator,
        }
    }

    /// Recompute the hash from the header fields.
    pub fn compute_hash(&self) -> BlockHash {
        compute_hash(self.height, &self.parent_hash, self.timestamp, self.generator)
    }

    /// Whether the stored hash matches the content.
    pub fn is_intact(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// First 8 hex characters of the hash, for log lines.
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..4])
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block(height={}, hash={}, generator={}, ts={})",
            self.height,
            self.short_hash(),
            self.generator,
            self.timestamp
        )
    }
}

fn compute_hash(
    height: u64,
    parent_hash: &BlockHash,
    timestamp: u64,
    generator: NodeId,
) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&height.to_le_bytes());
    hasher.update(parent_hash);
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&generator.to_le_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_block_properties() {
        let genesis = Block::genesis(1_000);
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.parent_hash, [0u8; 32]);
        assert_eq!(genesis.timestamp, 1_000);
        assert!(genesis.is_intact());
    }

    #[test]
    fn genesis_hash_is_deterministic() {
        assert_eq!(Block::genesis(5).hash, Block::genesis(5).hash);
        assert_ne!(Block::genesis(5).hash, Block::genesis(6).hash);
    }

    #[test]
    fn new_block_links_to_parent() {
        let genesis = Block::genesis(0);
        let block = Block::new(&genesis, 3, 2_000);
        assert_eq!(block.height, 1);
        assert_eq!(block.parent_hash, genesis.hash);
        assert_eq!(block.generator, 3);
        assert!(block.is_intact());
    }

    #[test]
    fn tampered_block_is_not_intact() {
        let mut block = Block::new(&Block::genesis(0), 1, 2_000);
        block.generator = 2;
        assert!(!block.is_intact());
    }

    #[test]
    fn generator_is_part_of_the_hash() {
        let genesis = Block::genesis(0);
        assert_ne!(
            Block::new(&genesis, 0, 2_000).hash,
            Block::new(&genesis, 1, 2_000).hash
        );
    }

    #[test]
    fn short_hash_is_hash_prefix() {
        let block = Block::genesis(0);
        assert!(block.hash_hex().starts_with(&block.short_hash()));
        assert_eq!(block.short_hash().len(), 8);
    }
}
