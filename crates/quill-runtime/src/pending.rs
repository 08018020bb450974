// ABOUTME: Completion handles returned to callers: Pending for single results, LoadAll for bulk loads.
// ABOUTME: Both can be polled without blocking from the game loop or awaited from async code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use quill_core::{EntityKey, StorageError, Versioned};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::oneshot::error::TryRecvError;
use tokio_stream::wrappers::ReceiverStream;

/// Sending half of a [`Pending`].
pub(crate) type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// The eventual result of a storage operation.
///
/// Dropping a `Pending` (or calling [`Pending::cancel`]) before its job
/// starts skips the job. Once backend I/O has begun it runs to completion and
/// the result is discarded.
#[derive(Debug)]
#[must_use = "a Pending does nothing unless polled, awaited or waited on"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, StorageError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already complete.
    pub fn ready(result: Result<T, StorageError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Take the result if the operation has finished. Returns `None` while it
    /// is still running. The result is handed out once; later calls report
    /// `StorageError::Closed`.
    pub fn try_take(&mut self) -> Option<Result<T, StorageError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(StorageError::Closed)),
        }
    }

    /// Block the current thread until the result is available.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> Result<T, StorageError> {
        self.rx.blocking_recv().unwrap_or(Err(StorageError::Closed))
    }

    /// Give up on the result.
    pub fn cancel(self) {}
}

impl<T> Future for Pending<T> {
    type Output = Result<T, StorageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StorageError::Closed)))
    }
}

/// Clears the load-in-progress flag when the producer finishes.
pub(crate) struct LoadGuard(Arc<AtomicBool>);

impl LoadGuard {
    /// Claim the flag, or `None` when a load is already running.
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) type LoadItem<R> = Result<(EntityKey, Versioned<R>), StorageError>;

/// A lazily filled sequence of every record of one entity type.
///
/// Records arrive as the backend produces them. Implements [`Stream`] for
/// async callers; the game loop drains it with [`LoadAll::try_next`].
#[derive(Debug)]
#[must_use = "a LoadAll yields nothing unless drained"]
pub struct LoadAll<R> {
    inner: ReceiverStream<LoadItem<R>>,
}

impl<R> LoadAll<R> {
    pub(crate) fn new(rx: mpsc::Receiver<LoadItem<R>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// A load that fails immediately with `err`.
    pub(crate) fn failed(err: StorageError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(err));
        Self::new(rx)
    }

    /// Poll without blocking: `Pending` while the next record is not ready,
    /// `Ready(None)` once the load is complete.
    pub fn try_next(&mut self) -> Poll<Option<LoadItem<R>>> {
        let rx: &mut mpsc::Receiver<LoadItem<R>> = self.inner.as_mut();
        match rx.try_recv() {
            Ok(item) => Poll::Ready(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Poll::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => Poll::Ready(None),
        }
    }

    /// Stop the load; the producer notices on its next send.
    pub fn cancel(self) {}
}

impl<R> Stream for LoadAll<R> {
    type Item = LoadItem<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
