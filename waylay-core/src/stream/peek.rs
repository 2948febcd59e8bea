//! A stream that replays a previously-read prefix before falling through to
//! the underlying stream. §3 "Peekable Stream", §4.4 step 4-5.
//!
//! Adapted from the framework's generic `PeekStream` combinator: the shape
//! (drain a peeked buffer before delegating reads to the inner stream,
//! delegate writes unconditionally) is unchanged, the implementation here is
//! narrowed to the one concrete peek buffer type (`std::io::Cursor<Vec<u8>>`)
//! the `CONNECT` handler actually produces, rather than being generic over
//! any `AsyncRead` peek source.

use std::{
    io::Cursor,
    pin::Pin,
    task::{Context, Poll, ready},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    /// Wraps `inner` so that bytes already consumed from it (and stashed in
    /// `peek`) are handed back to the first reader(s) before genuinely new
    /// bytes are read off the wire.
    pub(crate) struct PeekStream<S> {
        done_peek: bool,
        #[pin]
        peek: Cursor<Vec<u8>>,
        #[pin]
        inner: S,
    }
}

impl<S> PeekStream<S> {
    pub(crate) fn new(peeked: Vec<u8>, inner: S) -> Self {
        Self {
            done_peek: peeked.is_empty(),
            peek: Cursor::new(peeked),
            inner,
        }
    }
}

impl<S: AsyncRead> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.project();
        if !*me.done_peek {
            let remaining = buf.remaining();
            ready!(me.peek.poll_read(cx, buf))?;
            if buf.remaining() == remaining {
                *me.done_peek = true;
            } else {
                return Poll::Ready(Ok(()));
            }
        }
        me.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Ensure at least one byte is available in `buf` (issuing one raw read if
/// it is currently empty, per §4.4 step 4's "read one byte, then drain
/// whatever remains"), then hand back everything `buf` holds. Because
/// `buf` is also where the request-head parser leaves any bytes it read
/// past the `CONNECT` request's terminating CRLF, this naturally replays
/// pipelined bytes instead of losing them.
pub(crate) async fn sniff_prefix<R>(reader: &mut R, buf: &mut bytes::BytesMut) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    if buf.is_empty() {
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
    }
    Ok(buf.split_to(buf.len()).to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_peeked_bytes_before_inner() {
        let inner = std::io::Cursor::new(b" world".to_vec());
        let mut stream = PeekStream::new(b"hello".to_vec(), inner);

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b" world");
    }

    #[tokio::test]
    async fn empty_peek_falls_through_immediately() {
        let inner = std::io::Cursor::new(b"data".to_vec());
        let mut stream = PeekStream::new(Vec::new(), inner);
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
    }

    #[tokio::test]
    async fn sniff_prefix_reuses_leftover_buf_without_reading() {
        let mut reader = std::io::Cursor::new(b"should not be touched".to_vec());
        let mut buf = bytes::BytesMut::from(&b"\x16\x03\x01remaining"[..]);
        let peek = sniff_prefix(&mut reader, &mut buf).await.unwrap();
        assert_eq!(peek, b"\x16\x03\x01remaining");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn sniff_prefix_reads_when_buf_empty() {
        let mut reader = std::io::Cursor::new(b"\x16\x03\x01hello".to_vec());
        let mut buf = bytes::BytesMut::new();
        let peek = sniff_prefix(&mut reader, &mut buf).await.unwrap();
        assert_eq!(peek, b"\x16\x03\x01hello");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "sniffing must not lose or duplicate bytes");
    }

    #[tokio::test]
    async fn write_passthrough() {
        let inner = Vec::new();
        let mut stream = PeekStream::new(Vec::new(), inner);
        stream.write_all(b"hi").await.unwrap();
        stream.flush().await.unwrap();
    }
}
