//! Session-wide byte-rate limiting
//!
//! A [`RateLimiter`] is a token bucket measured in bytes. One limiter is
//! shared by every virtual connection of a session, so all streams compete
//! for the same budget and a rate change applies to streams that are
//! already open. [`LimitedIo`] wraps a single stream: each read or write
//! first takes tokens from the bucket, then performs the I/O, and returns
//! whatever it did not use.
//!
//! Waiting for tokens, and I/O parked on the wrapped stream, are tied to
//! the stream's cancellation token, so closing the stream releases a
//! blocked reader or writer immediately.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Upper bound on the bucket size, and so on a single I/O chunk
const MAX_BURST: f64 = 4.0 * 1024.0 * 1024.0;

/// Transfer ceiling of a session
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Limit {
    /// No throttling
    #[default]
    Infinite,
    /// Bytes per second
    Bps(f64),
}

impl Limit {
    /// Build a limit from a raw rate.
    ///
    /// Non-finite rates mean unlimited; negative rates are clamped to zero,
    /// which blocks all I/O until the limit is raised.
    pub fn bps(rate: f64) -> Self {
        if !rate.is_finite() {
            if rate.is_nan() || rate > 0.0 {
                return Limit::Infinite;
            }
            return Limit::Bps(0.0);
        }
        Limit::Bps(rate.max(0.0))
    }

    /// Whether this limit disables throttling
    pub fn is_infinite(&self) -> bool {
        matches!(self, Limit::Infinite)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Infinite => f.write_str("unlimited"),
            Limit::Bps(rate) => write!(f, "{} B/s", rate),
        }
    }
}

fn burst_for(limit: Limit) -> f64 {
    match limit {
        Limit::Infinite => 0.0,
        Limit::Bps(rate) if rate <= 0.0 => 0.0,
        Limit::Bps(rate) => rate.clamp(1.0, MAX_BURST),
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}

#[derive(Debug)]
struct Bucket {
    limit: Limit,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn advance(&mut self, now: Instant) {
        if let Limit::Bps(rate) = self.limit {
            let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate).min(self.burst);
        }
        self.last = now;
    }
}

#[derive(Debug, PartialEq)]
enum Reservation {
    /// Tokens taken, proceed
    Ready,
    /// Tokens taken on credit, proceed at the deadline
    Delay(Instant),
    /// Rate is zero; nothing taken, wait for a limit change
    Blocked,
}

/// Token bucket shared by all streams of one session
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    changed: Notify,
}

impl RateLimiter {
    /// A limiter that never throttles
    pub fn unlimited() -> Self {
        Self::new(Limit::Infinite)
    }

    /// A limiter starting with a full bucket
    pub fn new(limit: Limit) -> Self {
        let burst = burst_for(limit);
        Self {
            bucket: Mutex::new(Bucket {
                limit,
                burst,
                tokens: burst,
                last: Instant::now(),
            }),
            changed: Notify::new(),
        }
    }

    /// Current limit
    pub fn limit(&self) -> Limit {
        self.bucket.lock().limit
    }

    /// Whether throttling is currently disabled
    pub fn is_unlimited(&self) -> bool {
        self.limit().is_infinite()
    }

    /// Change the limit for every stream sharing this limiter.
    ///
    /// Streams currently waiting for tokens re-evaluate against the new
    /// limit right away.
    pub fn set_limit(&self, limit: Limit) {
        {
            let mut bucket = self.bucket.lock();
            bucket.advance(Instant::now());
            let was_infinite = bucket.limit.is_infinite();
            bucket.limit = limit;
            bucket.burst = burst_for(limit);
            bucket.tokens = if was_infinite {
                bucket.burst
            } else {
                bucket.tokens.min(bucket.burst)
            };
        }
        self.changed.notify_waiters();
    }

    /// Largest amount worth requesting for one I/O call of `want` bytes
    fn chunk(&self, want: usize) -> usize {
        let burst = self.bucket.lock().burst as usize;
        want.min(burst.max(1))
    }

    fn reserve(&self, n: usize) -> Reservation {
        let mut bucket = self.bucket.lock();
        let rate = match bucket.limit {
            Limit::Infinite => return Reservation::Ready,
            Limit::Bps(rate) => rate,
        };

        let now = Instant::now();
        bucket.advance(now);

        let n = n as f64;
        if bucket.tokens >= n {
            bucket.tokens -= n;
            return Reservation::Ready;
        }
        if rate <= 0.0 {
            return Reservation::Blocked;
        }

        let deadline = Duration::try_from_secs_f64((n - bucket.tokens) / rate)
            .ok()
            .and_then(|wait| now.checked_add(wait));
        match deadline {
            Some(deadline) => {
                bucket.tokens -= n;
                Reservation::Delay(deadline)
            }
            // the debt would outlast any representable instant
            None => Reservation::Blocked,
        }
    }

    fn refund(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut bucket = self.bucket.lock();
        if !bucket.limit.is_infinite() {
            bucket.tokens = (bucket.tokens + n as f64).min(bucket.burst);
        }
    }

    /// Wait until `n` bytes may be transferred, or fail once `cancel` fires
    pub async fn acquire(self: &Arc<Self>, n: usize, cancel: &CancellationToken) -> io::Result<()> {
        acquire(Arc::clone(self), n, cancel.clone()).await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Tokens taken on credit, returned unless the wait runs to completion
struct Debit<'a> {
    limiter: &'a RateLimiter,
    n: usize,
    armed: bool,
}

impl Drop for Debit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.refund(self.n);
        }
    }
}

async fn acquire(limiter: Arc<RateLimiter>, n: usize, cancel: CancellationToken) -> io::Result<()> {
    loop {
        // Registered before reserving so a concurrent set_limit is never missed.
        let changed = limiter.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        match limiter.reserve(n) {
            Reservation::Ready => return Ok(()),
            Reservation::Blocked => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(closed_error()),
                    _ = &mut changed => {}
                }
            }
            Reservation::Delay(deadline) => {
                let mut debit = Debit {
                    limiter: &limiter,
                    n,
                    armed: true,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(closed_error()),
                    _ = tokio::time::sleep_until(deadline) => {
                        debit.armed = false;
                        return Ok(());
                    }
                    _ = &mut changed => {}
                }
            }
        }
    }
}

type Acquire = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

enum Allowance {
    Unlimited,
    Granted(usize),
}

/// Token acquisition state of one direction of a stream
#[derive(Default)]
struct Gate {
    pending: Option<(Acquire, usize)>,
}

impl Gate {
    fn poll_allowance(
        &mut self,
        cx: &mut Context<'_>,
        limiter: &Arc<RateLimiter>,
        cancel: &CancellationToken,
        want: usize,
    ) -> Poll<io::Result<Allowance>> {
        if self.pending.is_none() {
            if limiter.is_unlimited() {
                return Poll::Ready(Ok(Allowance::Unlimited));
            }
            let n = limiter.chunk(want);
            let wait = acquire(Arc::clone(limiter), n, cancel.clone());
            self.pending = Some((Box::pin(wait), n));
        }

        let Some((wait, n)) = self.pending.as_mut() else {
            return Poll::Ready(Ok(Allowance::Unlimited));
        };
        let n = *n;
        let result = ready!(wait.as_mut().poll(cx));
        self.pending = None;
        result?;
        Poll::Ready(Ok(Allowance::Granted(n)))
    }
}

/// A duplex stream throttled by a shared [`RateLimiter`]
pub struct LimitedIo<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    read: Gate,
    write: Gate,
}

impl<S> LimitedIo<S> {
    /// Wrap `inner`; pending I/O and waits for tokens abort when `cancel`
    /// fires
    pub fn new(inner: S, limiter: Arc<RateLimiter>, cancel: CancellationToken) -> Self {
        Self {
            inner,
            limiter,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            read: Gate::default(),
            write: Gate::default(),
        }
    }

    /// Called when the inner stream parked; registers the task with the
    /// token so a cancel wakes it.
    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        self.cancelled.as_mut().poll(cx).is_ready()
    }

    /// The wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The wrapped stream, bypassing the limiter
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Token that aborts this stream's waits
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(closed_error()));
        }
        if buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let allowance =
            ready!(this
                .read
                .poll_allowance(cx, &this.limiter, &this.cancel, buf.remaining()))?;
        let granted = match allowance {
            Allowance::Unlimited => {
                return match Pin::new(&mut this.inner).poll_read(cx, buf) {
                    Poll::Pending if this.poll_cancelled(cx) => Poll::Ready(Err(closed_error())),
                    polled => polled,
                };
            }
            Allowance::Granted(granted) => granted,
        };

        let allowed = granted.min(buf.remaining());
        let mut window = ReadBuf::new(buf.initialize_unfilled_to(allowed));
        match Pin::new(&mut this.inner).poll_read(cx, &mut window) {
            Poll::Pending => {
                // Nothing to read yet: hand the tokens back to sibling streams.
                this.limiter.refund(granted);
                if this.poll_cancelled(cx) {
                    return Poll::Ready(Err(closed_error()));
                }
                Poll::Pending
            }
            Poll::Ready(result) => {
                let n = window.filled().len();
                buf.advance(n);
                this.limiter.refund(granted - n);
                Poll::Ready(result)
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(closed_error()));
        }
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let allowance =
            ready!(this
                .write
                .poll_allowance(cx, &this.limiter, &this.cancel, buf.len()))?;
        let granted = match allowance {
            Allowance::Unlimited => {
                return match Pin::new(&mut this.inner).poll_write(cx, buf) {
                    Poll::Pending if this.poll_cancelled(cx) => Poll::Ready(Err(closed_error())),
                    polled => polled,
                };
            }
            Allowance::Granted(granted) => granted,
        };

        let allowed = granted.min(buf.len());
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]) {
            Poll::Pending => {
                this.limiter.refund(granted);
                if this.poll_cancelled(cx) {
                    return Poll::Ready(Err(closed_error()));
                }
                Poll::Pending
            }
            Poll::Ready(Ok(n)) => {
                this.limiter.refund(granted.saturating_sub(n));
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.limiter.refund(granted);
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Pending if this.poll_cancelled(cx) => Poll::Ready(Err(closed_error())),
            polled => polled,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
