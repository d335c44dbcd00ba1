//! Concurrency budget for downstream handlers.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counted semaphore capping the number of handlers executing downstream.
///
/// A permit is held for exactly the duration of one handler invocation and
/// returns to the pool when dropped, on success, error and panic alike.
#[derive(Clone, Debug)]
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl PermitPool {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait for a permit. Dropping the returned future abandons the wait
    /// without consuming a permit.
    pub async fn acquire(&self) -> crate::Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| "permit pool closed".into())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Handlers currently executing under a permit.
    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.available())
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
