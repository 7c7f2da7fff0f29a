use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Capability-stripping stream wrapper.
///
/// The relay's sniffing path needs every byte from the upstream to pass
/// through its own buffer. Wrapping both ends in `Downgrade` pins the copy to
/// the plain `poll_read`/`poll_write` pair: vectored-write passthrough is
/// deliberately not forwarded, so no specialization can bypass the buffer.
pub struct Downgrade<S> {
    inner: S,
}

impl<S> Downgrade<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Downgrade<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Downgrade<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    // is_write_vectored / poll_write_vectored intentionally left at their
    // defaults: the wrapper exists to keep the copy on the plain path.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn passes_bytes_through() {
        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = Downgrade::new(client);
        let mut other = Downgrade::new(server);

        wrapped.write_all(b"hello").await.unwrap();
        wrapped.flush().await.unwrap();

        let mut buf = [0u8; 5];
        other.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn vectored_writes_are_not_advertised() {
        let (client, _server) = tokio::io::duplex(64);
        let wrapped = Downgrade::new(client);
        assert!(!wrapped.is_write_vectored());
    }
}
