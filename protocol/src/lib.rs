// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # DPoS Simulator - Core Library
//!
//! A small network of nodes that take turns forging blocks in fixed time
//! slots, gossip them over TCP and agree on finality through a pluggable
//! consensus engine.
//!
//! ## Architecture
//!
//! - **config** - Network constants and the per-node `NodeConfig`.
//! - **time** - Slot arithmetic over a swappable time source.
//! - **storage** - Blocks and the in-memory ledger.
//! - **consensus** - The engine trait and a prepare/commit implementation.
//! - **network** - Peer mesh, framing, dispatch, broadcast and forging.
//! - **stats** - Per-node counters.

pub mod config;
pub mod consensus;
pub mod network;
pub mod stats;
pub mod storage;
pub mod time;
