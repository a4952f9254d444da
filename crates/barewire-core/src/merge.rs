//! Fan-in of a dynamically growing set of async producers.
//!
//! A `StreamMerger` is the single consumer of any number of producer streams.
//! Producers are registered through a cloneable [`MergerHandle`], including
//! from inside an already-draining producer; this is how the transformer
//! schedules recursively discovered dependencies.
//!
//! Termination is computed by reference counting: the merged stream ends once
//! every registered producer has finished *and* every handle has been
//! dropped, so no further registrations can arrive. A fixed snapshot count
//! would end too early when producers register more producers.

use futures::stream::{BoxStream, SelectAll};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Handle for registering producers into a [`StreamMerger`].
///
/// Dropping the last handle (while all registered producers are finished)
/// terminates the merged stream.
#[derive(Debug)]
pub struct MergerHandle<T> {
    tx: mpsc::UnboundedSender<BoxStream<'static, T>>,
}

impl<T> Clone for MergerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> MergerHandle<T> {
    /// Register a new producer to be drained concurrently.
    ///
    /// May be called at any time, including from within a producer that is
    /// itself being drained. If the merger has already been dropped the
    /// producer is discarded.
    pub fn add(&self, producer: impl Stream<Item = T> + Send + 'static) {
        let _ = self.tx.send(producer.boxed());
    }
}

/// Single-consumer, multi-producer fan-in over async streams.
///
/// Yields items in the order they become available; there is no global
/// ordering across producers, but FIFO order within one producer is
/// preserved. A producer that ends (for any reason) terminates only itself.
pub struct StreamMerger<T> {
    incoming: mpsc::UnboundedReceiver<BoxStream<'static, T>>,
    active: SelectAll<BoxStream<'static, T>>,
    closed: bool,
}

// The producer streams themselves are opaque; report how many are live.
impl<T> fmt::Debug for StreamMerger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMerger")
            .field("active", &self.active.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> StreamMerger<T> {
    /// Create a merger and its first handle.
    #[must_use]
    pub fn new() -> (Self, MergerHandle<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: rx,
                active: SelectAll::new(),
                closed: false,
            },
            MergerHandle { tx },
        )
    }
}

impl<T: Send + 'static> Stream for StreamMerger<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        // Pull in any producers registered since the last poll, so a stream
        // added by a currently draining producer joins this same pass.
        while !this.closed {
            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(producer)) => this.active.push(producer),
                Poll::Ready(None) => this.closed = true,
                Poll::Pending => break,
            }
        }

        match Pin::new(&mut this.active).poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                if this.closed {
                    Poll::Ready(None)
                } else {
                    // No live producers, but handles still exist; the channel
                    // poll above registered our waker for the next `add`.
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
