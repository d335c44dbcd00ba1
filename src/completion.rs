//! One-shot completion signal for queued requests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const SETTLED: u8 = 2;

/// Tracks the terminal state of a queued request; settles at most once.
///
/// The work item settles it when the handler finishes (or fails to start);
/// the controller instead claims it when the queue deadline fires. Whichever
/// side settles first wins, and the loser drops its outcome. Once the work
/// item has marked the handler as started, the deadline can no longer claim
/// the request: it stopped waiting in the queue and the handler owns the
/// response from there on.
pub(crate) struct Completion {
    state: AtomicU8,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
        })
    }

    /// Record that the handler is about to run. No-op when the deadline
    /// already claimed the request.
    pub(crate) fn start(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Settle with the handler outcome. Returns false when the deadline got
    /// there first; the caller then drops its result.
    pub(crate) fn try_settle(&self) -> bool {
        self.state.swap(SETTLED, Ordering::AcqRel) != SETTLED
    }

    /// Claim the request for the deadline path. Fails once the handler has
    /// started or the outcome is already settled.
    pub(crate) fn claim_timeout(&self) -> bool {
        self.state
            .compare_exchange(PENDING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SETTLED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_at_most_once() {
        let completion = Completion::new();

        assert!(completion.try_settle());
        assert!(!completion.try_settle());
        assert!(completion.is_settled());
    }

    #[test]
    fn deadline_claims_pending_request() {
        let completion = Completion::new();

        assert!(completion.claim_timeout());
        // the late handler outcome is dropped
        assert!(!completion.try_settle());
    }

    #[test]
    fn deadline_cannot_claim_started_request() {
        let completion = Completion::new();
        completion.start();

        assert!(!completion.claim_timeout());
        assert!(completion.try_settle());
    }

    #[test]
    fn deadline_cannot_claim_settled_request() {
        let completion = Completion::new();
        assert!(completion.try_settle());

        assert!(!completion.claim_timeout());
    }

    #[test]
    fn start_after_claim_is_a_no_op() {
        let completion = Completion::new();
        assert!(completion.claim_timeout());

        completion.start();
        assert!(!completion.try_settle());
    }
}
