//! Byte streams and outbound connectors

use crate::address::Address;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Anything the engines can proxy over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream, so plain TCP, TLS and test pipes flow through the
/// same engines
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound connections on behalf of a [`ConnectionContext`].
///
/// [`ConnectionContext`]: crate::context::ConnectionContext
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &Address) -> io::Result<BoxedStream>;
}

/// Plain TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &Address) -> io::Result<BoxedStream> {
        let target = address.socket_addr_string();
        let stream = timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true)?;
        debug!(address = %address, "Outbound connection established");
        Ok(Box::new(stream))
    }
}

/// Replays bytes that were already read off `inner` before reading on.
///
/// Sniffing (TLS detection, protocol detection, proxy handshakes) consumes
/// bytes the next stage still has to see.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Wrap `stream` so `prefix` is read first; no-op for an empty prefix.
pub fn with_prefix(prefix: impl Into<Bytes>, stream: BoxedStream) -> BoxedStream {
    let prefix = prefix.into();
    if prefix.is_empty() {
        stream
    } else {
        Box::new(PrefixedStream::new(prefix, stream))
    }
}
