//! # Protocol Configuration & Constants
//!
//! Every tunable of the simulated network lives here. The constants are the
//! defaults; [`NodeConfig`] gathers them into one value that the binary
//! overrides from the command line.
//!
//! The polling design of the forging scheduler relies on
//! `POLL_INTERVAL << SLOT_DURATION`. That relationship is enforced by
//! [`NodeConfig::validate`], not by the scheduler itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::Slot;

/// Node identifiers are small integers, dense in `[0, number_of_peers)`.
pub type NodeId = u64;

// ---------------------------------------------------------------------------
// Network Shape
// ---------------------------------------------------------------------------

/// Number of simulated participants. Node IDs are drawn from `[0, N)`.
pub const NUMBER_OF_PEERS: u64 = 10;

/// Number of delegates allowed to forge. Slot `s` belongs to delegate
/// `s % NUMBER_OF_DELEGATES`, so nodes with an ID at or above this value
/// only relay.
pub const NUMBER_OF_DELEGATES: u64 = 5;

/// Base listen port. Node `i` listens on `DEFAULT_LISTEN_PORT + i`.
pub const DEFAULT_LISTEN_PORT: u16 = 3000;

/// Host every simulated node binds to and dials.
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Width of one forging slot.
pub const SLOT_DURATION_MS: u64 = 10_000;

/// Chain epoch in Unix milliseconds (2024-01-01T00:00:00Z). Slot 0 starts here.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

/// Sleep between scheduler checks when nothing needs to happen.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep after the scheduler evaluated a fresh slot.
pub const FORGE_COOLDOWN: Duration = Duration::from_secs(1);

/// Pause between two decoded messages on one connection.
pub const MESSAGE_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on establishing an outbound TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on writing one frame to a peer.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Base delay between retries. Attempt `n` waits `n * RETRY_BACKOFF`.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Maximum clock skew tolerated on an incoming block timestamp.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Dial attempts per candidate peer during bootstrap.
pub const DIAL_ATTEMPTS: u32 = 3;

/// Send attempts per peer per broadcast.
pub const SEND_ATTEMPTS: u32 = 3;

/// Consecutive failed broadcasts after which a peer is pruned.
pub const MAX_PEER_FAILURES: u32 = 3;

/// Largest frame accepted on the wire. 4 MiB is far above any block the
/// simulation produces.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Runtime configuration of a single node.
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Participants in the simulation.
    pub number_of_peers: u64,
    /// Forging delegates, a prefix of the participant ID space.
    pub number_of_delegates: u64,
    /// Host to bind and dial.
    pub listen_host: String,
    /// Base port; the node adds its own ID.
    pub base_port: u16,
    /// Chain epoch (Unix ms).
    pub epoch_ms: u64,
    /// Slot width in milliseconds.
    pub slot_duration_ms: u64,
    pub poll_interval: Duration,
    pub forge_cooldown: Duration,
    pub message_interval: Duration,
    pub dial_timeout: Duration,
    pub send_timeout: Duration,
    pub retry_backoff: Duration,
    pub dial_attempts: u32,
    pub send_attempts: u32,
    pub max_peer_failures: u32,
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            number_of_peers: NUMBER_OF_PEERS,
            number_of_delegates: NUMBER_OF_DELEGATES,
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            base_port: DEFAULT_LISTEN_PORT,
            epoch_ms: EPOCH_MS,
            slot_duration_ms: SLOT_DURATION_MS,
            poll_interval: POLL_INTERVAL,
            forge_cooldown: FORGE_COOLDOWN,
            message_interval: MESSAGE_INTERVAL,
            dial_timeout: DIAL_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
            dial_attempts: DIAL_ATTEMPTS,
            send_attempts: SEND_ATTEMPTS,
            max_peer_failures: MAX_PEER_FAILURES,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl NodeConfig {
    /// Checks the relationships between fields that the runtime assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_peers == 0 {
            return Err(ConfigError::NoPeers);
        }
        if self.number_of_delegates == 0 {
            return Err(ConfigError::NoDelegates);
        }
        if self.number_of_delegates > self.number_of_peers {
            return Err(ConfigError::TooManyDelegates {
                delegates: self.number_of_delegates,
                peers: self.number_of_peers,
            });
        }
        if self.poll_interval.as_millis() as u64 >= self.slot_duration_ms {
            return Err(ConfigError::PollIntervalTooLong {
                poll_ms: self.poll_interval.as_millis() as u64,
                slot_ms: self.slot_duration_ms,
            });
        }
        let highest_port = u64::from(self.base_port) + self.number_of_peers - 1;
        if highest_port > u64::from(u16::MAX) {
            return Err(ConfigError::PortOverflow(highest_port));
        }
        Ok(())
    }

    /// `host:port` this node listens on. The port is `base_port + id`.
    pub fn listen_addr(&self, id: NodeId) -> String {
        format!("{}:{}", self.listen_host, u64::from(self.base_port) + id)
    }

    /// Delegate entitled to forge in `slot`.
    pub fn delegate_for_slot(&self, slot: Slot) -> NodeId {
        slot % self.number_of_delegates
    }
}

/// Rejected configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("number_of_peers must be at least 1")]
    NoPeers,
    #[error("number_of_delegates must be at least 1")]
    NoDelegates,
    #[error("{delegates} delegates cannot exceed {peers} peers")]
    TooManyDelegates { delegates: u64, peers: u64 },
    #[error("poll interval {poll_ms}ms must be shorter than the {slot_ms}ms slot")]
    PollIntervalTooLong { poll_ms: u64, slot_ms: u64 },
    #[error("listen port {0} is out of range")]
    PortOverflow(u64),
}
