//! Stream adapters for response bodies
//!
//! Axum handlers return before the body is sent, so anything that must live
//! as long as the transfer (an admission ticket, a cancellation guard, a log
//! record) is moved into the body stream itself.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

/// Keeps `guard` alive until the stream ends or is dropped, whichever is first.
pub struct GuardedStream<S, G> {
    inner: Pin<Box<S>>,
    guard: Option<G>,
}

impl<S, G> GuardedStream<S, G> {
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner: Box::pin(inner),
            guard: Some(guard),
        }
    }
}

impl<S, G> Stream for GuardedStream<S, G>
where
    S: Stream,
    G: Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match me.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                me.guard.take();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Progress of one response body, shared between the body stream and
/// whoever reports on it afterwards
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes: AtomicU64,
    completed: AtomicBool,
    failed: AtomicBool,
}

/// How a response body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every chunk was handed to the connection
    Complete,
    /// The body stream produced an error partway through
    Failed,
    /// The body was dropped before its end, usually a client disconnect
    Aborted,
}

impl TransferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferOutcome::Complete => "complete",
            TransferOutcome::Failed => "failed",
            TransferOutcome::Aborted => "aborted",
        }
    }
}

impl TransferStats {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn outcome(&self) -> TransferOutcome {
        if self.failed.load(Ordering::Acquire) {
            TransferOutcome::Failed
        } else if self.completed.load(Ordering::Acquire) {
            TransferOutcome::Complete
        } else {
            TransferOutcome::Aborted
        }
    }
}

/// Records byte count and end state of the stream into [`TransferStats`]
pub struct MeteredStream<S> {
    inner: Pin<Box<S>>,
    stats: Arc<TransferStats>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, stats: Arc<TransferStats>) -> Self {
        Self {
            inner: Box::pin(inner),
            stats,
        }
    }
}

impl<S, E> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        let polled = me.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                me.stats
                    .bytes
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Poll::Ready(Some(Err(_))) => me.stats.failed.store(true, Ordering::Release),
            Poll::Ready(None) => me.stats.completed.store(true, Ordering::Release),
            Poll::Pending => {}
        }
        polled
    }
}
