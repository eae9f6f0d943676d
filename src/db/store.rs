//! Work-queue contract consumed by the dispatcher.
//!
//! Each operation is a single atomic database operation. Any of them may fail with a
//! transient [`StoreError`]; callers treat that as "try again next cycle".

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::job::{ClaimedJob, FailureOutcome, JobDetail, JobFailure};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lease up to `batch_size` due jobs to `worker_id`, oldest-due first.
    /// Returns an empty batch when nothing is due.
    async fn claim_due(&self, batch_size: u32, worker_id: &str)
        -> Result<Vec<ClaimedJob>, StoreError>;

    // The three writes below only touch a row still CLAIMED by `worker_id`. A job
    // whose lease was taken over by another worker is left to its new owner.

    /// Mark a claimed job delivered. Repeating the call is a no-op.
    async fn schedule_success(
        &self,
        job_id: i64,
        worker_id: &str,
        status_code: u16,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt and push the job out by the retry policy, or
    /// dead-letter it when attempts are exhausted.
    async fn schedule_failure(
        &self,
        job_id: i64,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<FailureOutcome, StoreError>;

    /// Hand an unprocessed claim back to the queue without counting an attempt.
    async fn release_claim(&self, job_id: i64, worker_id: &str) -> Result<(), StoreError>;

    /// Soonest time any non-terminal job becomes claimable, or [`far_future`].
    async fn next_wake(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Joined read/camera data for a job, `None` if the reference rows are gone.
    async fn get_job_detail(&self, job_id: i64) -> Result<Option<JobDetail>, StoreError>;
}

/// What arrived on the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    /// A job row became claimable.
    Job(String),
    /// Echo of a liveness heartbeat.
    Heartbeat,
}

/// A live push subscription.
#[async_trait]
pub trait WakeSubscription: Send {
    /// Next event; `Ok(None)` means the underlying connection was lost.
    async fn recv(&mut self) -> Result<Option<WakeEvent>, StoreError>;
}

/// Source of push notifications for the push wake strategy.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn WakeSubscription>, StoreError>;

    /// Send a heartbeat that every live subscription receives as [`WakeEvent::Heartbeat`].
    async fn heartbeat(&self) -> Result<(), StoreError>;
}

/// Sentinel returned by `next_wake` when no job is waiting.
pub fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job row: {0}")]
    Corrupt(String),

    #[error("Job {0} is not claimed by this worker")]
    NotClaimed(i64),
}
