//! Idle connection supervision.
//!
//! Every accepted connection's I/O is wrapped in an [`IdleStream`] that stamps
//! a shared [`ActivityClock`] whenever bytes move in either direction. The
//! connection task races the hyper connection against
//! [`IdleSupervisor::expired`] and drops the connection when it fires.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Last-activity timestamp shared between a stream and its supervisor.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    origin: Instant,
    last: Arc<AtomicU64>,
}

impl ActivityClock {
    /// Creates a clock whose last activity is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Returns when activity was last recorded.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_nanos(self.last.load(Ordering::Relaxed))
    }

    /// Returns how long the clock has not moved.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

pin_project! {
    /// I/O wrapper that records reads and writes on an [`ActivityClock`].
    #[derive(Debug)]
    pub struct IdleStream<S> {
        #[pin]
        inner: S,
        clock: ActivityClock,
    }
}

impl<S> IdleStream<S> {
    /// Wraps `inner`, stamping `clock` on activity.
    pub fn new(inner: S, clock: ActivityClock) -> Self {
        Self { inner, clock }
    }

    /// Returns the wrapped I/O.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwraps the I/O.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for IdleStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            if buf.filled().len() > before {
                this.clock.touch();
            }
        }
        res
    }
}

impl<S: AsyncWrite> AsyncWrite for IdleStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                this.clock.touch();
            }
        }
        res
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                this.clock.touch();
            }
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Per-connection inactivity timer.
#[derive(Debug, Clone)]
pub struct IdleSupervisor {
    timeout: Option<Duration>,
    clock: ActivityClock,
}

impl IdleSupervisor {
    /// Creates a supervisor. `None` disables it.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            clock: ActivityClock::new(),
        }
    }

    /// Returns the configured idle duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the clock this supervisor watches.
    #[must_use]
    pub fn clock(&self) -> &ActivityClock {
        &self.clock
    }

    /// Wraps connection I/O so its activity resets the timer.
    pub fn wrap<S>(&self, io: S) -> IdleStream<S> {
        IdleStream::new(io, self.clock.clone())
    }

    /// Completes once the connection has been idle for the configured
    /// duration. Never completes when disabled.
    pub async fn expired(&self) {
        let Some(timeout) = self.timeout else {
            return std::future::pending().await;
        };
        loop {
            let deadline = self.clock.last_activity() + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_activity() {
        let supervisor = IdleSupervisor::new(Some(Duration::from_secs(5)));
        let started = Instant::now();
        supervisor.expired().await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pushes_deadline() {
        let supervisor = IdleSupervisor::new(Some(Duration::from_secs(5)));
        let (client, server) = tokio::io::duplex(64);
        let mut stream = supervisor.wrap(server);
        let mut client = client;

        let started = Instant::now();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0_u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
        }
        supervisor.expired().await;
        assert_eq!(started.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_count_as_activity() {
        let supervisor = IdleSupervisor::new(Some(Duration::from_secs(2)));
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = supervisor.wrap(server);

        tokio::time::sleep(Duration::from_secs(1)).await;
        stream.write_all(b"pong").await.unwrap();
        assert_eq!(supervisor.clock().idle_for(), Duration::ZERO);

        let mut buf = [0_u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_while_waiting_rearms() {
        let supervisor = IdleSupervisor::new(Some(Duration::from_secs(5)));
        let mut expired = tokio_test::task::spawn(supervisor.expired());
        tokio_test::assert_pending!(expired.poll());

        tokio::time::advance(Duration::from_secs(4)).await;
        supervisor.clock().touch();
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_pending!(expired.poll());

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio_test::assert_ready!(expired.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_expires() {
        let supervisor = IdleSupervisor::new(None);
        let result = tokio::time::timeout(Duration::from_secs(3600), supervisor.expired()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = ActivityClock::new();
        let first = clock.last_activity();
        clock.touch();
        assert!(clock.last_activity() >= first);
    }
}
