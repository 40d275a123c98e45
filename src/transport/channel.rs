//! Byte channels and pooled server connections.

use crate::transport::pool::PoolKey;
use futures_util::FutureExt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Plain or TLS byte stream to a server.
pub enum ByteChannel {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl ByteChannel {
    pub fn is_secure(&self) -> bool {
        matches!(self, ByteChannel::Secure(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            ByteChannel::Plain(tcp) => tcp,
            ByteChannel::Secure(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for ByteChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteChannel::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ByteChannel::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ByteChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ByteChannel::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ByteChannel::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteChannel::Plain(s) => Pin::new(s).poll_flush(cx),
            ByteChannel::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ByteChannel::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ByteChannel::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of a non-blocking look at an idle channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Nothing pending, peer still connected
    Idle,
    /// Peer closed its side
    PeerClosed,
    /// Bytes arrived that no request asked for
    UnexpectedData,
    /// The socket reported an error
    Broken,
}

/// One transport connection to a server, owned by at most one request at a time.
pub struct ServerConnection {
    id: u64,
    key: PoolKey,
    stream: BufReader<ByteChannel>,
    timeout_at: Instant,
    keep_alive_hint: Option<Duration>,
    close_requested: bool,
}

impl ServerConnection {
    /// Wrap an established channel.
    pub fn new(key: PoolKey, channel: ByteChannel, timeout_at: Instant) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(connection = id, key = %key, secure = channel.is_secure(), "opened server connection");
        Self {
            id,
            key,
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, channel),
            timeout_at,
            keep_alive_hint: None,
            close_requested: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the pool this connection belongs to.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_secure(&self) -> bool {
        self.stream.get_ref().is_secure()
    }

    pub fn timeout_at(&self) -> Instant {
        self.timeout_at
    }

    pub fn set_timeout_at(&mut self, at: Instant) {
        self.timeout_at = at;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.timeout_at <= now
    }

    /// Idle lifetime advertised by the server through `Keep-Alive: timeout=`.
    pub fn keep_alive_hint(&self) -> Option<Duration> {
        self.keep_alive_hint
    }

    pub fn set_keep_alive_hint(&mut self, hint: Option<Duration>) {
        self.keep_alive_hint = hint;
    }

    /// Mark the connection for closing instead of reuse.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Probe the channel without blocking.
    pub fn health(&self) -> ChannelHealth {
        if !self.stream.buffer().is_empty() {
            return ChannelHealth::UnexpectedData;
        }
        let mut probe = [0u8; 1];
        match self.stream.get_ref().tcp().peek(&mut probe).now_or_never() {
            None => ChannelHealth::Idle,
            Some(Ok(0)) => ChannelHealth::PeerClosed,
            Some(Ok(_)) => ChannelHealth::UnexpectedData,
            Some(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => ChannelHealth::PeerClosed,
            Some(Err(_)) => ChannelHealth::Broken,
        }
    }

    /// Write a full request and flush it.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let channel = self.stream.get_mut();
        channel.write_all(bytes).await?;
        channel.flush().await
    }

    /// Close the channel, sending TLS close_notify where applicable.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.get_mut().shutdown().await {
            tracing::trace!(connection = self.id, error = %e, "error during connection shutdown");
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("secure", &self.is_secure())
            .field("timeout_at", &self.timeout_at)
            .field("keep_alive_hint", &self.keep_alive_hint)
            .finish()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        tracing::trace!(connection = self.id, key = %self.key, "closed server connection");
    }
}

impl AsyncRead for ServerConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncBufRead for ServerConnection {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().stream).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().stream).consume(amt)
    }
}
