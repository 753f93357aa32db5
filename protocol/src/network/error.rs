//! Error types for the networking layer.

use std::time::Duration;

use thiserror::Error;

use crate::config::NodeId;

/// Transport and protocol faults.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Socket-level I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame exceeds the configured limit.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// Every dial attempt to a peer failed.
    #[error("dial to peer {peer_id} at {addr} failed after {attempts} attempts: {reason}")]
    DialFailed {
        peer_id: NodeId,
        addr: String,
        attempts: u32,
        reason: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {}ms", elapsed.as_millis())]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The remote end closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Failures of node-level operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
