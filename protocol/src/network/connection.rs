//! Per-connection receive loops and the accept loop.
//!
//! Each stream, inbound or dialed, gets one task that reads frames and
//! hands them to [`Node::process_message`] one at a time. A frame that
//! fails to decode is skipped; a broken stream ends the task and closes the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::error::NetworkError;
use super::message::{FrameReader, ReadError};
use super::node::{shutdown_requested, Node};
use super::peer::Connection;
use crate::stats::NodeStats;

/// Spawns [`handle_connection`] for a stream this node dialed.
pub(crate) fn spawn_connection_handler<R>(
    node: &Arc<Node>,
    reader: FrameReader<R>,
    conn: Arc<Connection>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(handle_connection(
        Arc::clone(node),
        reader,
        conn,
        node.shutdown_signal(),
    ))
}

/// Receives messages until the stream ends or shutdown is signalled.
pub async fn handle_connection<R>(
    node: Arc<Node>,
    mut reader: FrameReader<R>,
    conn: Arc<Connection>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send,
{
    debug!(node_id = node.id, remote = %conn.remote(), conn_id = conn.id(), "connection handler started");
    let interval = node.config().message_interval;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            next = reader.next_message() => next,
        };

        match next {
            Ok(msg) => {
                trace!(node_id = node.id, kind = msg.kind(), remote = %conn.remote(), "message received");
                let outcome = node.process_message(msg, &conn);
                trace!(node_id = node.id, ?outcome, "message dispatched");
            }
            Err(ReadError::Malformed(e)) => {
                warn!(node_id = node.id, remote = %conn.remote(), error = %e, "skipping malformed frame");
                NodeStats::incr(&node.counters().malformed_frames);
            }
            Err(ReadError::Fatal(NetworkError::ConnectionClosed)) => {
                debug!(node_id = node.id, remote = %conn.remote(), "remote closed connection");
                break;
            }
            Err(ReadError::Fatal(e)) => {
                warn!(node_id = node.id, remote = %conn.remote(), error = %e, "connection failed");
                break;
            }
        }

        if !pause_unless_shutdown(&mut shutdown, interval).await {
            break;
        }
    }

    node.forget_connection(&conn);
    conn.close().await;
    debug!(node_id = node.id, conn_id = conn.id(), "connection handler stopped");
}

/// Sleeps for `delay`. Returns `false` as soon as shutdown is signalled.
pub(crate) async fn pause_unless_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Accepts inbound streams until shutdown, then waits for their handlers.
pub(crate) async fn accept_loop(node: Arc<Node>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut handlers = JoinSet::new();
    let max_frame_size = node.config().max_frame_size;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(node_id = node.id, %remote, error = %e, "could not set TCP_NODELAY");
                    }
                    debug!(node_id = node.id, %remote, "accepted connection");
                    let (read_half, write_half) = stream.into_split();
                    let conn = Connection::new(remote.to_string(), write_half);
                    handlers.spawn(handle_connection(
                        Arc::clone(&node),
                        FrameReader::new(read_half, max_frame_size),
                        conn,
                        node.shutdown_signal(),
                    ));
                }
                Err(e) => {
                    warn!(node_id = node.id, error = %e, "accept failed");
                    if !pause_unless_shutdown(&mut shutdown, node.config().retry_backoff).await {
                        break;
                    }
                }
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drop(listener);
    while handlers.join_next().await.is_some() {}
    info!(node_id = node.id, "listener closed");
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::config::NodeConfig;
    use crate::consensus::ConsensusEngine;
    use crate::network::message::{Message, StageMessage};
    use crate::storage::{Block, Blockchain};
    use crate::time::{ManualTimeSource, Slot, SlotClock};

    struct Sink;

    impl ConsensusEngine for Sink {
        fn add_block(&self, _block: &Block, _slot: Slot) {}
        fn process_stage_message(&self, _msg: StageMessage) {}
    }

    fn node() -> Arc<Node> {
        let clock = SlotClock::with_source(0, 1_000, Arc::new(ManualTimeSource::new(5_000)));
        let config = NodeConfig {
            message_interval: Duration::from_millis(1),
            ..NodeConfig::default()
        };
        let chain = Arc::new(Blockchain::new(0, clock.clone(), config.number_of_delegates));
        Node::new(0, config, chain, Arc::new(Sink), clock)
    }

    #[tokio::test]
    async fn handler_registers_peer_and_cleans_up_on_eof() {
        let node = node();
        let (mut remote, local) = tokio::io::duplex(4096);
        let (_unused, writer) = tokio::io::duplex(64);
        let conn = Connection::new("inbound", writer);

        let task = spawn_connection_handler(&node, FrameReader::new(local, 1 << 20), Arc::clone(&conn));
        remote
            .write_all(&Message::init(3).encode_frame(1 << 20).unwrap())
            .await
            .unwrap();

        for _ in 0..100 {
            if node.registry().contains(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(node.registry().contains(3));

        drop(remote);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(conn.is_closed());
        assert!(!node.registry().contains(3));
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_the_connection() {
        let node = node();
        let (mut remote, local) = tokio::io::duplex(4096);
        let (_unused, writer) = tokio::io::duplex(64);
        let conn = Connection::new("inbound", writer);
        let task = spawn_connection_handler(&node, FrameReader::new(local, 1 << 20), Arc::clone(&conn));

        remote.write_all(&2u32.to_le_bytes()).await.unwrap();
        remote.write_all(&[0xFF, 0xFF]).await.unwrap();
        remote
            .write_all(&Message::init(4).encode_frame(1 << 20).unwrap())
            .await
            .unwrap();

        for _ in 0..100 {
            if node.registry().contains(4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(node.registry().contains(4));
        assert_eq!(node.stats().malformed_frames, 1);
        assert!(!conn.is_closed());

        node.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_ends_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(pause_unless_shutdown(&mut rx, Duration::from_millis(10)).await);

        let started = tokio::time::Instant::now();
        let pause = tokio::spawn(async move { pause_unless_shutdown(&mut rx, Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        tx.send_replace(true);

        assert!(!pause.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
