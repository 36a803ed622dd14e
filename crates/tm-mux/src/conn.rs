//! Virtual connections
//!
//! A [`VirtualConn`] is one logical stream inside a session. Its I/O runs
//! through the session's shared rate limiter and is added to the session's
//! traffic counters. Closing is idempotent at the flag level: the first
//! close cancels pending limiter waits and counts the stream closed, any
//! later close returns [`MuxError::AlreadyClosed`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tm_core::{BoxedIo, Link};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;
use crate::limiter::{LimitedIo, RateLimiter};
use crate::stats::{StreamStat, TrafficStat};

struct ConnState {
    closed: AtomicBool,
    cancel: CancellationToken,
    streams: Arc<StreamStat>,
}

impl ConnState {
    /// Returns false if the connection was already closed
    fn mark_closed(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Release blocked limiter waits before the backend stream is torn down.
        self.cancel.cancel();
        self.streams.close_one();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One logical duplex stream multiplexed inside a session
pub struct VirtualConn {
    io: LimitedIo<BoxedIo>,
    state: Arc<ConnState>,
    traffic: Arc<TrafficStat>,
    link: Link,
}

impl VirtualConn {
    /// Wrap a backend stream. The caller has already counted it open.
    pub(crate) fn new(
        stream: BoxedIo,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
        traffic: Arc<TrafficStat>,
        streams: Arc<StreamStat>,
        link: Link,
    ) -> Self {
        Self {
            io: LimitedIo::new(stream, limiter, cancel.clone()),
            state: Arc::new(ConnState {
                closed: AtomicBool::new(false),
                cancel,
                streams,
            }),
            traffic,
            link,
        }
    }

    /// Close the stream.
    ///
    /// Only the first call has an effect; later calls return
    /// [`MuxError::AlreadyClosed`] and leave the counters alone.
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if !self.state.mark_closed() {
            return Err(MuxError::AlreadyClosed);
        }
        self.io.get_mut().shutdown().await?;
        Ok(())
    }

    /// Handle that closes this connection from another task
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Whether `close` has run, here or through a [`CloseHandle`]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Local address of the physical connection carrying this stream
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local
    }

    /// Remote address of the physical connection carrying this stream
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote
    }
}

impl Drop for VirtualConn {
    fn drop(&mut self) {
        self.state.mark_closed();
    }
}

impl fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConn")
            .field("local", &self.link.local)
            .field("remote", &self.link.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for VirtualConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        if poll.is_ready() {
            this.traffic.incr_rx(buf.filled().len() - before);
        }
        poll
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.io).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.traffic.incr_tx(n);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Closes a [`VirtualConn`] without owning it.
///
/// Closing through a handle aborts blocked reads and writes and counts the
/// stream closed; the backend stream itself is released when the owning
/// connection is dropped.
#[derive(Clone)]
pub struct CloseHandle {
    state: Arc<ConnState>,
}

impl CloseHandle {
    /// Same contract as [`VirtualConn::close`]
    pub fn close(&self) -> Result<(), MuxError> {
        if self.state.mark_closed() {
            Ok(())
        } else {
            Err(MuxError::AlreadyClosed)
        }
    }

    /// Whether the connection is closed
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::Limit;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Fixture {
        limiter: Arc<RateLimiter>,
        traffic: Arc<TrafficStat>,
        streams: Arc<StreamStat>,
    }

    impl Fixture {
        fn new(limit: Limit) -> Self {
            Self {
                limiter: Arc::new(RateLimiter::new(limit)),
                traffic: Arc::new(TrafficStat::new()),
                streams: Arc::new(StreamStat::new()),
            }
        }

        fn conn(&self) -> (VirtualConn, DuplexStream) {
            let (a, b) = tokio::io::duplex(64 * 1024);
            self.streams.open_one();
            let conn = VirtualConn::new(
                Box::new(a),
                Arc::clone(&self.limiter),
                CancellationToken::new(),
                Arc::clone(&self.traffic),
                Arc::clone(&self.streams),
                Link::default(),
            );
            (conn, b)
        }
    }

    #[tokio::test]
    async fn test_close_twice() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut conn, _peer) = fixture.conn();
        assert_eq!(fixture.streams.load(), (1, 1));

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(fixture.streams.load(), (1, 0));

        assert!(matches!(conn.close().await, Err(MuxError::AlreadyClosed)));
        assert_eq!(fixture.streams.load(), (1, 0));
    }

    #[tokio::test]
    async fn test_handle_then_owner_close() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut conn, _peer) = fixture.conn();
        let handle = conn.close_handle();

        handle.close().unwrap();
        assert!(matches!(handle.close(), Err(MuxError::AlreadyClosed)));
        assert!(matches!(conn.close().await, Err(MuxError::AlreadyClosed)));
        assert_eq!(fixture.streams.load(), (1, 0));
    }

    #[tokio::test]
    async fn test_drop_counts_closed_once() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut closed, _p1) = fixture.conn();
        let (dropped, _p2) = fixture.conn();

        closed.close().await.unwrap();
        drop(closed);
        drop(dropped);
        assert_eq!(fixture.streams.load(), (2, 0));
    }

    #[tokio::test]
    async fn test_traffic_is_counted() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut conn, mut peer) = fixture.conn();

        conn.write_all(b"hello world").await.unwrap();
        peer.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(fixture.traffic.load(), (4, 11));
    }

    #[tokio::test]
    async fn test_io_after_close_fails() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut conn, _peer) = fixture.conn();
        conn.close_handle().close().unwrap();

        let err = conn.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(fixture.traffic.load(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_close_releases_blocked_read() {
        let fixture = Fixture::new(Limit::Bps(0.0));
        let (mut conn, mut peer) = fixture.conn();
        peer.write_all(b"stuck behind the limiter").await.unwrap();

        let handle = conn.close_handle();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.close()
        });

        let mut buf = [0u8; 32];
        let result = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("read should be released by close");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
        closer.await.unwrap().unwrap();
        assert_eq!(fixture.streams.load(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_close_releases_read_on_idle_stream() {
        let fixture = Fixture::new(Limit::Infinite);
        let (mut conn, _peer) = fixture.conn();

        let handle = conn.close_handle();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.close()
        });

        let start = tokio::time::Instant::now();
        let mut buf = [0u8; 32];
        let result = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("read should be released by close");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(start.elapsed() < Duration::from_secs(1));
        closer.await.unwrap().unwrap();
    }
}
