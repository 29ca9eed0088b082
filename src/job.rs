//! Reserved-job contract and shared state tracking

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::QueueResult;

/// Terminal-state flags shared between a reserved job and the worker.
///
/// Each flag transitions at most once; the `mark_*` methods return whether
/// this call performed the transition so callers can make follow-up work
/// (deleting the backend message, writing the failure ledger) exactly-once.
#[derive(Debug, Default, Clone)]
pub struct JobState {
    deleted: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Neither deleted nor released yet.
    pub fn is_pending(&self) -> bool {
        !self.is_deleted() && !self.is_released()
    }

    pub fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::SeqCst)
    }

    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }
}

/// A job popped off a backend and held under a reservation.
///
/// Implementations wrap the backend-native message handle and compose a
/// [`JobState`]. `delete` and `release` are mutually exclusive terminal
/// transitions; calling either a second time (or after the other) is a no-op.
/// A failed job is additionally deleted from the backend so it is never
/// redelivered.
#[async_trait]
pub trait ReservedJob: Send + Sync {
    /// The decoded envelope.
    fn envelope(&self) -> &Envelope;

    /// The raw payload as it sits in the backend.
    fn raw_payload(&self) -> &str;

    /// Connection name this job was reserved from.
    fn connection(&self) -> &str;

    /// Queue name this job was reserved from.
    fn queue(&self) -> &str;

    /// 1-based delivery count, captured at reservation time.
    ///
    /// Each backend keeps its own counter: the database backend increments a
    /// column when claiming, Redis and AMQP carry the counter inside the
    /// payload, Beanstalk and SQS report it through broker statistics.
    fn attempts(&self) -> u32;

    /// Shared terminal-state flags.
    fn state(&self) -> &JobState;

    /// Remove the job from the backend. Idempotent.
    async fn delete(&self) -> QueueResult<()>;

    /// Return the job to the backend, available again after `delay`.
    /// Idempotent, and a no-op once the job was deleted.
    async fn release(&self, delay: Duration) -> QueueResult<()>;

    /// Job id from the envelope.
    fn job_id(&self) -> &str {
        &self.envelope().id
    }

    /// Handler name from the envelope.
    fn name(&self) -> &str {
        &self.envelope().job
    }

    /// Attempt limit from the envelope, `None` for unbounded.
    fn max_tries(&self) -> Option<u32> {
        self.envelope().max_tries
    }

    /// Timeout from the envelope in seconds.
    fn timeout(&self) -> Option<u64> {
        self.envelope().timeout
    }

    fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    fn is_released(&self) -> bool {
        self.state().is_released()
    }

    fn has_failed(&self) -> bool {
        self.state().has_failed()
    }

    /// Flip the failed flag; returns whether this call flipped it.
    fn mark_failed(&self) -> bool {
        self.state().mark_failed()
    }
}

impl std::fmt::Debug for dyn ReservedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedJob")
            .field("id", &self.job_id())
            .field("name", &self.name())
            .field("queue", &self.queue())
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let state = JobState::new();
        assert!(!state.is_deleted());
        assert!(!state.is_released());
        assert!(!state.has_failed());
        assert!(state.is_pending());
    }

    #[test]
    fn transitions_fire_once() {
        let state = JobState::new();
        assert!(state.mark_deleted());
        assert!(!state.mark_deleted());
        assert!(state.is_deleted());

        assert!(state.mark_failed());
        assert!(!state.mark_failed());
    }

    #[test]
    fn clones_share_flags() {
        let state = JobState::new();
        let other = state.clone();
        state.mark_released();
        assert!(other.is_released());
        assert!(!other.is_pending());
    }
}
