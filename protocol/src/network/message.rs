//! # Wire Messages
//!
//! Every frame on a peer connection carries one [`Message`]:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```
//!
//! The enum tag is the message type. `Init` and `Block` are interpreted by
//! the node; `Stage` belongs to the consensus engine and is forwarded
//! without being opened.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::NetworkError;
use crate::config::NodeId;
use crate::storage::Block;

/// Opaque consensus-stage payload. `stage` is the engine's own tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMessage {
    pub stage: u8,
    pub payload: Vec<u8>,
}

/// Top-level envelope exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake: the sender's node ID. First frame on every dialed connection.
    Init(NodeId),
    /// A forged block being gossiped.
    Block(Block),
    /// Consensus-stage traffic.
    Stage(StageMessage),
}

impl Message {
    pub fn init(node_id: NodeId) -> Self {
        Self::Init(node_id)
    }

    pub fn block(block: Block) -> Self {
        Self::Block(block)
    }

    pub fn stage(stage: u8, payload: Vec<u8>) -> Self {
        Self::Stage(StageMessage { stage, payload })
    }

    /// Tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Block(_) => "block",
            Self::Stage(_) => "stage",
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, NetworkError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Serialize with the 4-byte length prefix.
    pub fn encode_frame(&self, max_size: usize) -> Result<Bytes, NetworkError> {
        let payload = self.serialize()?;
        if payload.len() > max_size {
            return Err(NetworkError::FrameTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(Bytes::from(buf))
    }
}

/// Error from [`FrameReader::next_message`].
///
/// `Fatal` errors mean the stream is unusable and the connection must be
/// closed. `Malformed` means one frame was skipped and the stream is still
/// aligned.
#[derive(Debug)]
pub enum ReadError {
    Fatal(NetworkError),
    Malformed(NetworkError),
}

/// Decodes length-prefixed messages from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Reads the next frame and decodes it.
    ///
    /// A clean EOF before a header surfaces as
    /// [`NetworkError::ConnectionClosed`].
    pub async fn next_message(&mut self) -> Result<Message, ReadError> {
        let mut header = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            let err = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NetworkError::ConnectionClosed
            } else {
                NetworkError::Io(e)
            };
            return Err(ReadError::Fatal(err));
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame_size {
            return Err(ReadError::Fatal(NetworkError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }));
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| ReadError::Fatal(NetworkError::Io(e)))?;

        Message::deserialize(&payload).map_err(ReadError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    const MAX: usize = 1 << 20;

    #[test]
    fn kind_tags() {
        assert_eq!(Message::init(3).kind(), "init");
        assert_eq!(Message::block(Block::genesis(0)).kind(), "block");
        assert_eq!(Message::stage(1, vec![]).kind(), "stage");
    }

    #[test]
    fn frame_carries_length_prefix() {
        let msg = Message::init(7);
        let frame = msg.encode_frame(MAX).unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(Message::deserialize(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let msg = Message::stage(1, vec![0u8; 64]);
        assert!(matches!(
            msg.encode_frame(16),
            Err(NetworkError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn reads_consecutive_frames_in_order() {
        let (mut client, server) = tokio::io::duplex(4096);
        let block = Block::new(&Block::genesis(0), 1, 99);
        let messages = vec![
            Message::init(1),
            Message::block(block),
            Message::stage(2, vec![9, 9, 9]),
        ];
        for msg in &messages {
            client.write_all(&msg.encode_frame(MAX).unwrap()).await.unwrap();
        }
        drop(client);

        let mut reader = FrameReader::new(server, MAX);
        for expected in &messages {
            assert_eq!(&reader.next_message().await.unwrap(), expected);
        }
        assert!(matches!(
            reader.next_message().await,
            Err(ReadError::Fatal(NetworkError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn garbage_payload_is_skipped_not_fatal() {
        let (mut client, server) = tokio::io::duplex(4096);
        let garbage = [0xFFu8; 3];
        client.write_all(&(garbage.len() as u32).to_le_bytes()).await.unwrap();
        client.write_all(&garbage).await.unwrap();
        client
            .write_all(&Message::init(4).encode_frame(MAX).unwrap())
            .await
            .unwrap();

        let mut reader = FrameReader::new(server, MAX);
        assert!(matches!(reader.next_message().await, Err(ReadError::Malformed(_))));
        assert_eq!(reader.next_message().await.unwrap(), Message::init(4));
    }

    #[tokio::test]
    async fn oversized_header_is_fatal() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&(1_000u32).to_le_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server, 100);
        assert!(matches!(
            reader.next_message().await,
            Err(ReadError::Fatal(NetworkError::FrameTooLarge { size: 1_000, max: 100 }))
        ));
    }
}
