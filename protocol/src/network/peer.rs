//! # Peers and Connections
//!
//! A [`Connection`] is the write side of one byte stream. Writes are
//! serialized by an async mutex so concurrent broadcast tasks never
//! interleave frames. A [`Peer`] binds a remote node ID to a connection and
//! keeps the consecutive-failure count used for pruning.
//!
//! Peers come from two places:
//!
//! - [`Peer::connect`] dials out and sends the `Init` handshake.
//! - An inbound `Init` makes the node wrap the accepting connection in a
//!   new `Peer` (see `Node::process_message`).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{NetworkError, Result};
use super::message::{FrameReader, Message};
use crate::config::{NodeConfig, NodeId};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a live stream to a remote node.
pub struct Connection {
    id: u64,
    remote: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wraps any async writer. `remote` is used in log lines only.
    pub fn new<W>(remote: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote: remote.into(),
            writer: Mutex::new(Some(Box::new(writer))),
            closed: AtomicBool::new(false),
        })
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes one pre-encoded frame within `timeout`.
    pub async fn send_frame(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(NetworkError::ConnectionClosed)?;
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok::<(), NetworkError>(())
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                operation: "send",
                elapsed: timeout,
            }),
        }
    }

    /// Encodes and writes one message.
    pub async fn send(&self, msg: &Message, max_frame_size: usize, timeout: Duration) -> Result<()> {
        let frame = msg.encode_frame(max_frame_size)?;
        self.send_frame(&frame, timeout).await
    }

    /// Shuts the write half down. Later sends fail with `ConnectionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(remote = %self.remote, error = %e, "error shutting down connection");
            }
        }
    }
}

/// A remote participant known to this node.
#[derive(Debug)]
pub struct Peer {
    /// Remote node ID.
    pub id: NodeId,
    /// ID of the node that owns this record.
    pub node_id: NodeId,
    conn: Arc<Connection>,
    failures: AtomicU32,
}

impl Peer {
    pub fn new(id: NodeId, node_id: NodeId, conn: Arc<Connection>) -> Self {
        Self {
            id,
            node_id,
            conn,
            failures: AtomicU32::new(0),
        }
    }

    /// Dials `addr`, retrying with linear backoff, and sends the `Init`
    /// handshake carrying `self_id`.
    ///
    /// Returns the peer together with a reader over the same stream so the
    /// caller can receive what the remote sends back.
    pub async fn connect(
        peer_id: NodeId,
        self_id: NodeId,
        addr: &str,
        config: &NodeConfig,
    ) -> Result<(Peer, FrameReader<OwnedReadHalf>)> {
        let attempts = config.dial_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::dial_once(peer_id, self_id, addr, config).await {
                Ok(connected) => {
                    info!(node_id = self_id, peer_id, %addr, attempt, "connected to peer");
                    return Ok(connected);
                }
                Err(e) => {
                    debug!(node_id = self_id, peer_id, %addr, attempt, error = %e, "dial attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
        }

        Err(NetworkError::DialFailed {
            peer_id,
            addr: addr.to_string(),
            attempts,
            reason: last_error,
        })
    }

    async fn dial_once(
        peer_id: NodeId,
        self_id: NodeId,
        addr: &str,
        config: &NodeConfig,
    ) -> Result<(Peer, FrameReader<OwnedReadHalf>)> {
        let stream = match tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(NetworkError::Timeout {
                    operation: "dial",
                    elapsed: config.dial_timeout,
                })
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let conn = Connection::new(addr, write_half);
        conn.send(&Message::init(self_id), config.max_frame_size, config.send_timeout)
            .await?;

        Ok((
            Peer::new(peer_id, self_id, conn),
            FrameReader::new(read_half, config.max_frame_size),
        ))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Consecutive broadcasts that failed on this peer.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Sends a frame, retrying up to `config.send_attempts` times.
    ///
    /// Success resets the failure counter; exhausting the attempts
    /// increments it.
    pub async fn send_frame_with_retry(&self, frame: &[u8], config: &NodeConfig) -> Result<()> {
        let attempts = config.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.conn.send_frame(frame, config.send_timeout).await {
                Ok(()) => {
                    self.failures.store(0, Ordering::Release);
                    return Ok(());
                }
                // A closed connection will not come back.
                Err(e @ NetworkError::ConnectionClosed) => return Err(self.record_failure(e)),
                Err(e) if attempt >= attempts => return Err(self.record_failure(e)),
                Err(e) => {
                    debug!(
                        node_id = self.node_id,
                        peer_id = self.id,
                        attempt,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(config.retry_backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Encodes `msg` and sends it with [`send_frame_with_retry`](Self::send_frame_with_retry).
    pub async fn send(&self, msg: &Message, config: &NodeConfig) -> Result<()> {
        let frame = msg.encode_frame(config.max_frame_size)?;
        self.send_frame_with_retry(&frame, config).await
    }

    fn record_failure(&self, error: NetworkError) -> NetworkError {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            node_id = self.node_id,
            peer_id = self.id,
            failures,
            error = %error,
            "send to peer failed"
        );
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config() -> NodeConfig {
        NodeConfig {
            dial_attempts: 2,
            send_attempts: 2,
            retry_backoff: Duration::from_millis(5),
            dial_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_sends_init_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = fast_config();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = FrameReader::new(stream, 1 << 20);
            reader.next_message().await.unwrap()
        });

        let (peer, _reader) = Peer::connect(5, 2, &addr, &config).await.unwrap();
        assert_eq!(peer.id, 5);
        assert_eq!(peer.node_id, 2);
        assert_eq!(accept.await.unwrap(), Message::init(2));
    }

    #[tokio::test]
    async fn failed_dial_is_a_typed_error() {
        // Bind then drop to obtain a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let Err(err) = Peer::connect(1, 0, &addr, &fast_config()).await else {
            panic!("dial to a closed port succeeded");
        };
        assert!(matches!(
            err,
            NetworkError::DialFailed { peer_id: 1, attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn closed_connection_counts_one_failure_per_broadcast() {
        let (client, _server) = tokio::io::duplex(1024);
        let peer = Peer::new(1, 0, Connection::new("test", client));
        peer.connection().close().await;
        assert!(peer.connection().is_closed());

        let frame = Message::init(0).encode_frame(1 << 20).unwrap();
        let err = peer.send_frame_with_retry(&frame, &fast_config()).await.unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionClosed));
        assert_eq!(peer.failures(), 1);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let (client, mut server) = tokio::io::duplex(1024);
        let peer = Peer::new(1, 0, Connection::new("test", client));
        peer.failures.store(2, Ordering::Release);

        let frame = Message::init(0).encode_frame(1 << 20).unwrap();
        peer.send_frame_with_retry(&frame, &fast_config()).await.unwrap();
        assert_eq!(peer.failures(), 0);

        let mut buf = vec![0u8; frame.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf[..], &frame[..]);
    }

    #[tokio::test]
    async fn stalled_writer_times_out() {
        // A 4-byte duplex buffer that is never drained blocks the write.
        let (client, _server) = tokio::io::duplex(4);
        let conn = Connection::new("stalled", client);
        let frame = Message::stage(1, vec![0u8; 64]).encode_frame(1 << 20).unwrap();
        let err = conn
            .send_frame(&frame, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { operation: "send", .. }));
    }
}
