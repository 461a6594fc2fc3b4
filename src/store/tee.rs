//! Reader adapter that keeps a copy of everything read through it

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Wraps an [`AsyncRead`] and buffers every byte that passes through
pub struct TeeReader<R> {
    inner: R,
    copied: Vec<u8>,
}

impl<R> TeeReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            copied: Vec::new(),
        }
    }

    /// Bytes read so far
    pub fn buffered(&self) -> &[u8] {
        &self.copied
    }

    /// Consume the adapter, returning the buffered bytes
    pub fn into_buffer(self) -> Vec<u8> {
        self.copied
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.copied.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
