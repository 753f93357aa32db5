//! # Network Module
//!
//! Peer mesh, wire protocol and block gossip for one simulated node.
//!
//! ## Architecture
//!
//! ```text
//! message.rs    - Message envelope and length-prefixed bincode framing
//! peer.rs       - Connection write half, Peer record, dial with retry
//! registry.rs   - Thread-safe peer map plus dialed-peer order
//! connection.rs - Accept loop and per-connection receive loops
//! node.rs       - Node lifecycle, dispatch and broadcast
//! forger.rs     - Slot-driven block production
//! error.rs      - Network and node error types
//! ```
//!
//! ## Design Decisions
//!
//! - A received block is re-broadcast to every peer. The ledger's has-block
//!   check is the only loop prevention, so the check and the consensus
//!   hand-off run under one lock.
//! - Broadcast never blocks the caller. Each peer gets its own send task
//!   with bounded retry; peers that keep failing are pruned.
//! - Dialed streams are read too, so a peer can answer on the connection it
//!   was dialed on.

pub mod connection;
pub mod error;
pub mod forger;
pub mod message;
pub mod node;
pub mod peer;
pub mod registry;

pub use connection::handle_connection;
pub use error::{NetworkError, NodeError};
pub use forger::{ForgeOutcome, ForgingScheduler};
pub use message::{FrameReader, Message, ReadError, StageMessage};
pub use node::{BroadcastReport, ConnectReport, Dispatch, LocalNode, Node};
pub use peer::{Connection, Peer};
pub use registry::PeerRegistry;
