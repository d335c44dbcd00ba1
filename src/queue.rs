//! Bounded FIFO of requests admitted with delay.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A unit of deferred work: the handler invocation for one queued request.
///
/// `work` acquires a permit, drives the handler and settles the request's
/// completion signal on every path; the enqueue timestamp only feeds the
/// dispatcher's wait-time logging.
pub(crate) struct WorkItem {
    pub(crate) work: BoxFuture<'static, ()>,
    pub(crate) enqueued_at: Instant,
}

impl WorkItem {
    pub(crate) fn new(work: BoxFuture<'static, ()>) -> Self {
        Self {
            work,
            enqueued_at: Instant::now(),
        }
    }
}

/// Sending half of the wait queue; the dispatcher owns the receiving half.
///
/// Capacity is fixed at construction. `size` is a non-blocking observation
/// used by the admission decision. The observation and a later enqueue are
/// deliberately not atomic: an enqueue that lost the race for the last slot
/// blocks until the dispatcher frees one, rather than dropping a request
/// that was already admitted.
pub(crate) struct WaitQueue {
    tx: mpsc::Sender<WorkItem>,
    capacity: usize,
}

impl WaitQueue {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity);

        (Self { tx, capacity }, rx)
    }

    /// Items currently queued.
    pub(crate) fn size(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) async fn enqueue(&self, item: WorkItem) -> crate::Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| "wait queue closed".into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn marker(order: &Arc<AtomicUsize>, index: usize) -> WorkItem {
        let order = Arc::clone(order);
        WorkItem::new(Box::pin(async move {
            // record the position at which the dispatcher ran this item
            let at = order.fetch_add(1, Ordering::SeqCst);
            assert_eq!(at, index);
        }))
    }

    #[tokio::test]
    async fn dequeues_in_enqueue_order() {
        let (queue, mut rx) = WaitQueue::new(8);
        let order = Arc::new(AtomicUsize::new(0));

        for index in 0..8 {
            queue.enqueue(marker(&order, index)).await.unwrap();
        }

        for _ in 0..8 {
            let item = rx.recv().await.unwrap();
            item.work.await;
        }
        assert_eq!(order.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn size_tracks_enqueue_and_dequeue() {
        let (queue, mut rx) = WaitQueue::new(2);
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_full());

        queue
            .enqueue(WorkItem::new(Box::pin(async {})))
            .await
            .unwrap();
        assert_eq!(queue.size(), 1);

        queue
            .enqueue(WorkItem::new(Box::pin(async {})))
            .await
            .unwrap();
        assert_eq!(queue.size(), 2);
        assert!(queue.is_full());

        rx.recv().await.unwrap();
        assert_eq!(queue.size(), 1);
        assert!(!queue.is_full());
    }

    #[tokio::test]
    async fn enqueue_fails_once_receiver_is_gone() {
        let (queue, rx) = WaitQueue::new(1);
        drop(rx);

        let err = queue
            .enqueue(WorkItem::new(Box::pin(async {})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "wait queue closed");
    }
}
