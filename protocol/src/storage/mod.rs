//! # Storage Module
//!
//! The ledger collaborator of the node.
//!
//! ```text
//! block.rs  - Block record and BLAKE3 hashing
//! chain.rs  - Ledger trait and the in-memory Blockchain
//! ```
//!
//! Nothing here is durable; a restarted node starts again from genesis.

pub mod block;
pub mod chain;

pub use block::{Block, BlockHash};
pub use chain::{Blockchain, CommitOutcome, Ledger};
