//! Accepted network connections.
//!
//! [`Connection`] wraps any async byte stream together with its endpoint
//! addresses. Connector selection sniffs the first bytes of a connection
//! with [`Connection::peek`]; peeked bytes are replayed by the next read so
//! the chosen connector sees the stream from the start.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Default number of bytes examined when sniffing a connection.
pub const PEEK_SIZE: usize = 4096;

/// Any bidirectional async byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An accepted connection with replayable peeked bytes.
pub struct Connection {
    id: Uuid,
    stream: Box<dyn Stream>,
    peer: SocketAddr,
    local: SocketAddr,
    /// Bytes read by `peek` that have not been consumed yet.
    buffered: BytesMut,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap `stream`, recording the endpoint addresses.
    pub fn new<S>(stream: S, peer: SocketAddr, local: SocketAddr) -> Self
    where
        S: Stream + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            stream: Box::new(stream),
            peer,
            local,
            buffered: BytesMut::new(),
        }
    }

    /// Wrap an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self::new(stream, peer, local))
    }

    /// Unique id of this connection (used as the session id in events).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Look at up to `max` bytes without consuming them.
    ///
    /// Waits for data only when nothing is buffered yet. With bytes already
    /// buffered, a larger `max` tops the buffer up with whatever the stream
    /// has ready and never waits. An empty slice means the peer closed the
    /// connection before sending anything.
    pub async fn peek(&mut self, max: usize) -> io::Result<&[u8]> {
        if self.buffered.len() < max {
            let mut chunk = vec![0u8; max - self.buffered.len()];
            let n = if self.buffered.is_empty() {
                self.stream.read(&mut chunk).await?
            } else {
                self.read_ready(&mut chunk).await?
            };
            self.buffered.extend_from_slice(&chunk[..n]);
        }
        let end = self.buffered.len().min(max);
        Ok(&self.buffered[..end])
    }

    /// Read what the stream can deliver right now; 0 when it would block.
    async fn read_ready(&mut self, chunk: &mut [u8]) -> io::Result<usize> {
        let stream = &mut self.stream;
        std::future::poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut chunk[..]);
            match Pin::new(&mut *stream).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.filled().len())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Ready(Ok(0)),
            }
        })
        .await
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            let replay = this.buffered.split_to(n);
            buf.put_slice(&replay);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// In-memory connection plus the peer's end of the pipe.
    pub(crate) fn pipe(peer: &str) -> (Connection, DuplexStream) {
        let (server, client) = tokio::io::duplex(PEEK_SIZE);
        let conn = Connection::new(
            server,
            peer.parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
        );
        (conn, client)
    }

    #[tokio::test]
    async fn test_peek_is_replayed_on_read() {
        let (mut conn, mut client) = pipe("10.1.2.3:5000");
        client.write_all(b"SSH-2.0-libssh").await.unwrap();

        assert_eq!(conn.peek(3).await.unwrap(), b"SSH");
        assert_eq!(conn.peek(PEEK_SIZE).await.unwrap(), b"SSH-2.0-libssh");

        let mut buf = vec![0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-libssh");
    }

    #[tokio::test]
    async fn test_larger_peek_picks_up_late_bytes_without_waiting() {
        let (mut conn, mut client) = pipe("10.1.2.3:5000");
        client.write_all(b"GET").await.unwrap();
        assert_eq!(conn.peek(PEEK_SIZE).await.unwrap(), b"GET");

        client.write_all(b" / HTTP/1.1").await.unwrap();
        let peeked = tokio::time::timeout(Duration::from_secs(1), conn.peek(PEEK_SIZE))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peeked, b"GET / HTTP/1.1");

        // Nothing more pending: still returns at once
        let peeked = tokio::time::timeout(Duration::from_secs(1), conn.peek(PEEK_SIZE))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peeked, b"GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn test_peek_on_closed_stream_is_empty() {
        let (mut conn, client) = pipe("10.1.2.3:5000");
        drop(client);
        assert!(conn.peek(PEEK_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_reach_peer() {
        let (mut conn, mut client) = pipe("10.1.2.3:5000");
        conn.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_addresses() {
        let (server, _client) = tokio::io::duplex(16);
        let conn = Connection::new(
            server,
            "192.168.1.7:61000".parse().unwrap(),
            "0.0.0.0:23".parse().unwrap(),
        );
        assert_eq!(conn.peer_addr().port(), 61000);
        assert_eq!(conn.local_addr().port(), 23);
    }
}
