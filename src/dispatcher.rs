//! Drains the wait queue and launches queued work.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::WorkItem;

/// Long-lived consumer of the wait queue.
///
/// Every item is launched on a fresh task so a slow handler never stalls the
/// drain loop. Items whose completion the queue deadline already claimed are
/// launched all the same: they run under a permit like any other, and their
/// outcome is dropped when they try to settle.
pub(crate) struct Dispatcher {
    queue: mpsc::Receiver<WorkItem>,
    shutdown: CancellationToken,
    enable_logs: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: mpsc::Receiver<WorkItem>,
        shutdown: CancellationToken,
        enable_logs: bool,
    ) -> Self {
        Self {
            queue,
            shutdown,
            enable_logs,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = self.queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if self.enable_logs {
                debug!(
                    message = "dispatching queued request",
                    waited_ms = item.enqueued_at.elapsed().as_millis() as u64
                );
            }

            tokio::spawn(item.work);
        }

        if self.enable_logs {
            debug!(message = "dispatcher stopped");
        }
    }
}
