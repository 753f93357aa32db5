//! Per-node counters.
//!
//! Plain atomics updated on the hot path. The node binary samples them into
//! Prometheus gauges; tests read them directly.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct NodeStats {
    pub blocks_forged: AtomicU64,
    pub blocks_relayed: AtomicU64,
    pub blocks_rejected: AtomicU64,
    pub blocks_duplicate: AtomicU64,
    pub stage_messages: AtomicU64,
    pub handshakes: AtomicU64,
    pub dial_failures: AtomicU64,
    pub send_failures: AtomicU64,
    pub peers_pruned: AtomicU64,
    pub malformed_frames: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub blocks_forged: u64,
    pub blocks_relayed: u64,
    pub blocks_rejected: u64,
    pub blocks_duplicate: u64,
    pub stage_messages: u64,
    pub handshakes: u64,
    pub dial_failures: u64,
    pub send_failures: u64,
    pub peers_pruned: u64,
    pub malformed_frames: u64,
}

impl NodeStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            blocks_forged: load(&self.blocks_forged),
            blocks_relayed: load(&self.blocks_relayed),
            blocks_rejected: load(&self.blocks_rejected),
            blocks_duplicate: load(&self.blocks_duplicate),
            stage_messages: load(&self.stage_messages),
            handshakes: load(&self.handshakes),
            dial_failures: load(&self.dial_failures),
            send_failures: load(&self.send_failures),
            peers_pruned: load(&self.peers_pruned),
            malformed_frames: load(&self.malformed_frames),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = NodeStats::default();
        NodeStats::incr(&stats.blocks_forged);
        NodeStats::incr(&stats.blocks_forged);
        NodeStats::incr(&stats.peers_pruned);

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_forged, 2);
        assert_eq!(snap.peers_pruned, 1);
        assert_eq!(snap.blocks_relayed, 0);
    }
}
