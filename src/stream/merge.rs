use std::pin::Pin;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Sink, Stream};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

/// The merged stream has ended and no longer accepts values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("merged stream closed")]
pub struct MergeClosed;

/// Create a stream fed by a [`Sink`] and an out-of-band controller at the same time.
///
/// Values from either side come out in the order they were submitted. The stream ends
/// when the controller closes it (after draining what was already submitted) or when
/// every sink and controller handle is dropped.
pub fn merge_channel<T: Send + 'static>(
    capacity: usize,
) -> (MergeSink<T>, MergeController<T>, MergedStream<T>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();

    let sink = MergeSink {
        tx: PollSender::new(tx.clone()),
    };
    let controller = MergeController {
        tx,
        closed: closed.clone(),
    };

    let inner = stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = closed.cancelled() => None,
                item = rx.recv() => item,
            };
            match next {
                Some(item) => yield item,
                None => break,
            }
        }
        // close() keeps what was submitted before it
        rx.close();
        while let Ok(item) = rx.try_recv() {
            yield item;
        }
    };

    (
        sink,
        controller,
        MergedStream {
            inner: Box::pin(inner),
        },
    )
}

/// The normal write path into a merged stream.
pub struct MergeSink<T> {
    tx: PollSender<T>,
}

impl<T> Unpin for MergeSink<T> {}

impl<T: Send + 'static> Clone for MergeSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Sink<T> for MergeSink<T> {
    type Error = MergeClosed;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), MergeClosed>> {
        self.tx.poll_reserve(cx).map_err(|_| MergeClosed)
    }

    fn start_send(mut self: Pin<&mut Self>, item: T) -> Result<(), MergeClosed> {
        self.tx.send_item(item).map_err(|_| MergeClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MergeClosed>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MergeClosed>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Out-of-band handle onto a merged stream.
pub struct MergeController<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for MergeController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T: Send + 'static> MergeController<T> {
    /// Push a value, waiting for buffer space.
    pub async fn push(&self, item: T) -> Result<(), MergeClosed> {
        if self.closed.is_cancelled() {
            return Err(MergeClosed);
        }
        self.tx.send(item).await.map_err(|_| MergeClosed)
    }

    /// Push a value only if there is buffer space right now.
    pub fn try_push(&self, item: T) -> Result<(), MergeClosed> {
        if self.closed.is_cancelled() {
            return Err(MergeClosed);
        }
        self.tx.try_send(item).map_err(|_| MergeClosed)
    }

    /// End the merged stream once everything already submitted has been read.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// The consumer side of [`merge_channel`].
pub struct MergedStream<T> {
    inner: BoxStream<'static, T>,
}

impl<T> Stream for MergedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.as_mut().poll_next(cx)
    }
}
