//! Network Module
//!
//! Peer and transport contracts used by the replication core, plus the TCP
//! implementation and its length-prefixed framing.

mod tcp;

pub use tcp::{TcpPeer, TcpTransport, TcpTransportOpts};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Identity of the sending peer
    pub from: String,
    /// Undecoded message body
    pub payload: Vec<u8>,
}

/// An established connection to a remote node
#[async_trait]
pub trait Peer: Send + Sync {
    /// Stable identity of the peer (its remote address)
    fn remote_addr(&self) -> &str;

    /// Whether this node initiated the connection
    fn is_outbound(&self) -> bool;

    /// Deliver one message to the peer, returning the bytes accepted
    async fn send(&self, data: &[u8]) -> Result<usize>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Receives connection lifecycle events from a transport
pub trait PeerHandler: Send + Sync {
    /// A connection became usable; called before any of its messages are delivered
    fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<()>;

    /// A connection's read side ended
    fn on_disconnect(&self, peer: &Arc<dyn Peer>);
}

/// Connection and messaging substrate consumed by the replication core
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the handler notified of new and lost peers
    fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>);

    /// Start accepting inbound connections (returns once listening)
    async fn listen_and_accept(&self) -> Result<()>;

    /// Open an outbound connection
    async fn dial(&self, address: &str) -> Result<()>;

    /// Take the inbound message stream; only the first call succeeds
    fn consume(&self) -> Result<mpsc::Receiver<Rpc>>;

    /// Release all transport resources
    async fn close(&self) -> Result<()>;
}

/// Bytes preceding every frame body: length then CRC32, both little-endian u32
pub const FRAME_HEADER_LEN: usize = 8;

/// Read one framed body from a reader
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let [l0, l1, l2, l3, c0, c1, c2, c3] = header;
    let length = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
    let checksum = u32::from_le_bytes([c0, c1, c2, c3]);

    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge { size: length, limit: max_frame_bytes });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != checksum {
        return Err(Error::ChecksumMismatch);
    }

    Ok(body)
}

/// Write one framed body to a writer as a single buffer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let length = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
