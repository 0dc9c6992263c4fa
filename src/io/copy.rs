//! Bidirectional relay between an inbound flow and its outbound socket
//!
//! Each direction owns one fixed-size buffer and only reads again after
//! the previous chunk has been fully written, so a slow writer stalls its
//! reader instead of growing memory. When one side reaches EOF, the
//! opposite writer is flushed and shut down while the other direction keeps
//! running. The first I/O error in either direction ends the relay.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Default per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest accepted buffer size
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;

/// Largest accepted buffer size
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from the inbound flow to the outbound socket
    pub client_to_upstream: u64,
    /// Bytes transferred from the outbound socket to the inbound flow
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client->upstream"),
            Self::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// A relay that stopped on an I/O error
#[derive(Debug, Error)]
#[error("{direction} transfer failed after {} bytes: {source}", .progress.total())]
pub struct RelayError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
    /// Bytes moved before the failure
    pub progress: CopyResult,
}

/// One direction: a buffer and how much of it is still unwritten
struct Pipe {
    buf: Box<[u8]>,
    /// `buf[written..filled]` is pending
    written: usize,
    filled: usize,
    eof: bool,
    closed: bool,
    moved: u64,
}

impl Pipe {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            written: 0,
            filled: 0,
            eof: false,
            closed: false,
            moved: 0,
        }
    }

    const fn finished(&self) -> bool {
        self.closed
    }

    /// Drives this direction until it blocks, fails, or the writer has been
    /// shut down after reader EOF.
    fn poll_pump<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.written < self.filled {
                let pending = &self.buf[self.written..self.filled];
                let n = ready!(writer.as_mut().poll_write(cx, pending))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                self.written += n;
                self.moved += n as u64;
                continue;
            }

            if self.eof {
                ready!(writer.as_mut().poll_flush(cx))?;
                // only this direction's writer; the peer may keep sending
                ready!(writer.as_mut().poll_shutdown(cx))?;
                self.closed = true;
                return Poll::Ready(Ok(()));
            }

            let mut chunk = ReadBuf::new(&mut self.buf);
            ready!(reader.as_mut().poll_read(cx, &mut chunk))?;
            self.written = 0;
            self.filled = chunk.filled().len();
            self.eof = self.filled == 0;
        }
    }
}

/// Owned bidirectional copy future.
///
/// Await `&mut relay` to keep access to the streams and byte counters
/// after the future is interrupted, e.g. by cancellation.
pub struct Relay<A, B> {
    client: A,
    upstream: B,
    up: Pipe,
    down: Pipe,
}

impl<A, B> Relay<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a relay; `buf_size` is clamped to
    /// [`MIN_BUFFER_SIZE`]..=[`MAX_BUFFER_SIZE`]
    pub fn new(client: A, upstream: B, buf_size: usize) -> Self {
        let buf_size = buf_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        Self {
            client,
            upstream,
            up: Pipe::new(buf_size),
            down: Pipe::new(buf_size),
        }
    }

    /// Bytes moved so far
    #[must_use]
    pub const fn progress(&self) -> CopyResult {
        CopyResult {
            client_to_upstream: self.up.moved,
            upstream_to_client: self.down.moved,
        }
    }

    /// Best-effort shutdown of both writers, bounded by `deadline`.
    ///
    /// Returns false if the deadline elapsed first.
    pub async fn shutdown(&mut self, deadline: Duration) -> bool {
        let client = &mut self.client;
        let upstream = &mut self.upstream;
        tokio::time::timeout(deadline, async move {
            let _ = tokio::join!(client.shutdown(), upstream.shutdown());
        })
        .await
        .is_ok()
    }
}

impl<A, B> Future for Relay<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<CopyResult, RelayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Self {
            client,
            upstream,
            up,
            down,
        } = &mut *self;

        let failed = if up.finished() {
            None
        } else {
            match up.poll_pump(cx, Pin::new(&mut *client), Pin::new(&mut *upstream)) {
                Poll::Ready(Err(e)) => Some((Direction::ClientToUpstream, e)),
                _ => None,
            }
        };
        let failed = failed.or_else(|| {
            if down.finished() {
                return None;
            }
            match down.poll_pump(cx, Pin::new(&mut *upstream), Pin::new(&mut *client)) {
                Poll::Ready(Err(e)) => Some((Direction::UpstreamToClient, e)),
                _ => None,
            }
        });

        if let Some((direction, source)) = failed {
            return Poll::Ready(Err(RelayError {
                direction,
                source,
                progress: self.progress(),
            }));
        }
        if up.finished() && down.finished() {
            Poll::Ready(Ok(self.progress()))
        } else {
            Poll::Pending
        }
    }
}

/// Copy in both directions until both reach EOF
///
/// # Errors
///
/// Returns the first I/O error from either direction.
pub async fn bidirectional_copy<A, B>(a: A, b: B) -> Result<CopyResult, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    Relay::new(a, b, DEFAULT_BUFFER_SIZE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copies_both_directions() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);
        let relay = tokio::spawn(bidirectional_copy(client_side, upstream_side));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();

        let result = relay.await.unwrap().unwrap();
        assert_eq!(result.client_to_upstream, 5);
        assert_eq!(result.upstream_to_client, 6);
        assert_eq!(result.total(), 11);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);
        let relay = tokio::spawn(bidirectional_copy(client_side, upstream_side));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // Upstream sees the request followed by EOF
        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // ...and can still answer
        upstream.write_all(b"response").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let result = relay.await.unwrap().unwrap();
        assert_eq!(result.client_to_upstream, 7);
        assert_eq!(result.upstream_to_client, 8);
    }

    #[tokio::test]
    async fn test_backpressure_bounds_buffering() {
        // Upstream never reads; the relay may hold at most one buffer plus
        // the duplex pipe capacity before the client's writes stall.
        let (mut client, client_side) = duplex(MIN_BUFFER_SIZE);
        let (upstream_side, _upstream) = duplex(MIN_BUFFER_SIZE);
        let mut relay = Relay::new(client_side, upstream_side, MIN_BUFFER_SIZE);

        let payload = vec![7u8; MIN_BUFFER_SIZE * 16];
        let write = client.write_all(&payload);
        tokio::select! {
            _ = &mut relay => panic!("relay finished unexpectedly"),
            _ = write => panic!("writer should be blocked by backpressure"),
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        assert!(relay.progress().client_to_upstream <= MIN_BUFFER_SIZE as u64);
    }

    #[tokio::test]
    async fn test_error_reports_direction_and_progress() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, upstream) = duplex(1024);
        let relay = tokio::spawn(bidirectional_copy(client_side, upstream_side));

        drop(upstream);
        client.write_all(b"lost").await.unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert_eq!(err.direction, Direction::ClientToUpstream);
        assert_eq!(err.source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_shutdown_signals_eof_to_both_peers() {
        let (mut client, client_side) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);
        let mut relay = Relay::new(client_side, upstream_side, MIN_BUFFER_SIZE);

        assert!(relay.shutdown(Duration::from_secs(1)).await);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        upstream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            client_to_upstream: 100,
            upstream_to_client: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
