//! Background loop that drains due alert jobs and delivers them.
//!
//! One dispatcher runs per process. Within a drain, jobs are handled strictly in claim
//! order: build the document, send it, record the outcome, then move to the next job.
//! No error from a single job stops the loop. Only cancellation and, in push mode, a
//! subscription that cannot be re-established end [`Dispatcher::run`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::Display;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::db::store::{JobStore, PushSource, StoreError, WakeEvent, WakeSubscription};
use crate::models::job::{ClaimedJob, JobFailure, JobStatus};
use crate::services::backoff::ResubscribeBackoff;
use crate::services::delivery::Sender;
use crate::services::hit_builder::build_hit_document;
use crate::services::storage::Presigner;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Lease owner written on claimed rows.
    pub worker_id: String,
    pub batch_size: u32,
    /// Deadline for a single delivery.
    pub send_timeout: Duration,
    /// Sleep floor, so a busy queue never spins.
    pub min_sleep: Duration,
    /// Sleep used when the next wake time cannot be read.
    pub fallback_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSettings {
    /// Expected heartbeat interval and the ceiling on any single wait.
    pub heartbeat: Duration,
    pub miss_factor: u32,
    pub resubscribe_base: Duration,
    pub resubscribe_cap: Duration,
    /// Total subscribe attempts before giving up.
    pub resubscribe_attempts: u32,
}

impl PushSettings {
    /// Silence longer than this marks the subscription stale.
    pub fn miss_after(&self) -> Duration {
        self.heartbeat.saturating_mul(self.miss_factor)
    }
}

/// Wake strategy as configured, before a push source is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum WakeStrategyKind {
    Interval { poll_interval: Duration },
    Push(PushSettings),
}

/// How the dispatcher decides to leave IDLE.
#[derive(Clone)]
pub enum WakeStrategy {
    /// Wake on a fixed timer, or earlier when a retry falls due.
    Interval { poll_interval: Duration },
    /// Wake on store notifications, bounded by the heartbeat ceiling.
    Push {
        settings: PushSettings,
        source: Arc<dyn PushSource>,
    },
}

impl WakeStrategy {
    pub fn from_kind(kind: WakeStrategyKind, source: Arc<dyn PushSource>) -> Self {
        match kind {
            WakeStrategyKind::Interval { poll_interval } => WakeStrategy::Interval { poll_interval },
            WakeStrategyKind::Push(settings) => WakeStrategy::Push { settings, source },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WakeStrategy::Interval { .. } => "interval",
            WakeStrategy::Push { .. } => "push",
        }
    }
}

/// Collaborators the dispatcher is built from.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Arc<dyn JobStore>,
    pub presigner: Arc<dyn Presigner>,
    pub sender: Arc<dyn Sender>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Idle,
    Draining,
    ShuttingDown,
}

/// Counters for one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub batches: u32,
    pub claimed: u32,
    pub delivered: u32,
    pub failed: u32,
    pub dead: u32,
    pub released: u32,
    /// Claims whose lease ran out before their turn in the batch.
    pub lease_lost: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("push subscription lost and not re-established after {attempts} attempts: {last_error}")]
    SubscriptionExhausted { attempts: u32, last_error: String },
}

pub struct Dispatcher {
    ctx: DispatchContext,
    settings: DispatchSettings,
    strategy: WakeStrategy,
    state: SchedulerState,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext, settings: DispatchSettings, strategy: WakeStrategy) -> Self {
        Self {
            ctx,
            settings,
            strategy,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Run until `cancel` fires, or until the push subscription is exhausted.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DispatchError> {
        tracing::info!(
            worker_id = %self.settings.worker_id,
            strategy = self.strategy.name(),
            batch_size = self.settings.batch_size,
            "Alert dispatcher starting"
        );

        let result = match self.strategy.clone() {
            WakeStrategy::Interval { poll_interval } => {
                self.run_interval(poll_interval, &cancel).await
            }
            WakeStrategy::Push { settings, source } => {
                self.run_push(&settings, source.as_ref(), &cancel).await
            }
        };

        self.transition(SchedulerState::ShuttingDown);
        match &result {
            Ok(()) => tracing::info!("Alert dispatcher stopped"),
            Err(e) => tracing::error!(error = %e, "Alert dispatcher stopped on fatal error"),
        }
        result
    }

    async fn run_interval(
        &mut self,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.drain(cancel).await;

        loop {
            let wait = self.sleep_duration(poll_interval).await;
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Dispatcher idle");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(wait) => {}
            }

            self.drain(cancel).await;
        }
    }

    async fn run_push(
        &mut self,
        push: &PushSettings,
        source: &dyn PushSource,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        // Subscribe before the first drain so nothing enqueued meanwhile is missed.
        let Some(mut subscription) = self.subscribe(source, push, cancel).await? else {
            return Ok(());
        };
        self.drain(cancel).await;

        let miss_after = push.miss_after();
        let mut last_event = Instant::now();

        loop {
            let wait = self.sleep_duration(push.heartbeat).await;

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = subscription.recv() => Some(received),
                _ = sleep(wait) => None,
            };

            match event {
                Some(Ok(Some(WakeEvent::Heartbeat))) => {
                    tracing::trace!("Push heartbeat received");
                    last_event = Instant::now();
                    continue;
                }
                Some(Ok(Some(WakeEvent::Job(id)))) => {
                    tracing::debug!(job_id = %id, "Push notification received");
                    last_event = Instant::now();
                }
                Some(lost) => {
                    if let Err(e) = lost {
                        tracing::warn!(error = %e, "Push subscription failed, resubscribing");
                    } else {
                        tracing::warn!("Push subscription closed, resubscribing");
                    }
                    drop(subscription);
                    let Some(fresh) = self.subscribe(source, push, cancel).await? else {
                        return Ok(());
                    };
                    subscription = fresh;
                    last_event = Instant::now();
                }
                None => {
                    let silent_for = last_event.elapsed();
                    if silent_for >= miss_after {
                        tracing::warn!(
                            silent_ms = silent_for.as_millis() as u64,
                            "No push traffic within miss window, resubscribing"
                        );
                        drop(subscription);
                        let Some(fresh) = self.subscribe(source, push, cancel).await? else {
                            return Ok(());
                        };
                        subscription = fresh;
                        last_event = Instant::now();
                    } else if silent_for >= push.heartbeat {
                        if let Err(e) = source.heartbeat().await {
                            tracing::warn!(error = %e, "Failed to send push heartbeat");
                        }
                    }
                }
            }

            // Notifications are only hints; drain whatever is due now.
            self.drain(cancel).await;
        }
    }

    /// Subscribe with bounded exponential backoff. `Ok(None)` means cancelled.
    async fn subscribe(
        &self,
        source: &dyn PushSource,
        push: &PushSettings,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn WakeSubscription>>, DispatchError> {
        let attempts = push.resubscribe_attempts.max(1);
        let mut backoff = ResubscribeBackoff::new(
            push.resubscribe_base,
            push.resubscribe_cap,
            attempts - 1,
        );

        loop {
            let err = match source.subscribe().await {
                Ok(subscription) => return Ok(Some(subscription)),
                Err(e) => e,
            };
            metrics::counter!("alert_resubscribe_failures_total").increment(1);

            let Some(delay) = backoff.next_delay() else {
                return Err(DispatchError::SubscriptionExhausted {
                    attempts,
                    last_error: err.to_string(),
                });
            };
            tracing::warn!(
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Push subscribe failed"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = sleep(delay) => {}
            }
        }
    }

    /// Claim and deliver batches until a claim comes back empty.
    ///
    /// Store errors end the drain early; the next wake retries.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> DrainSummary {
        let mut summary = DrainSummary::default();
        self.transition(SchedulerState::Draining);

        while !cancel.is_cancelled() {
            let batch = match self
                .ctx
                .store
                .claim_due(self.settings.batch_size, &self.settings.worker_id)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim due jobs, retrying next wake");
                    break;
                }
            };

            if batch.is_empty() {
                break;
            }

            summary.batches += 1;
            summary.claimed += batch.len() as u32;
            metrics::counter!("alert_jobs_claimed_total").increment(batch.len() as u64);

            let mut jobs = batch.into_iter();
            for job in jobs.by_ref() {
                // Past its lease the job may already belong to another worker.
                if job.lease_expires_at <= Utc::now() {
                    summary.lease_lost += 1;
                    tracing::warn!(
                        job_id = job.id,
                        lease_expires_at = %job.lease_expires_at,
                        "Lease expired before delivery, leaving job to be reclaimed"
                    );
                    continue;
                }
                self.process(job, &mut summary).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
            for job in jobs {
                self.release(job.id, &mut summary).await;
            }
        }

        if summary.claimed > 0 {
            tracing::info!(
                batches = summary.batches,
                claimed = summary.claimed,
                delivered = summary.delivered,
                failed = summary.failed,
                dead = summary.dead,
                lease_lost = summary.lease_lost,
                "Drain complete"
            );
        }
        self.transition(SchedulerState::Idle);
        summary
    }

    async fn process(&self, job: ClaimedJob, summary: &mut DrainSummary) {
        let detail = match self.ctx.store.get_job_detail(job.id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                let failure = JobFailure {
                    message: format!("plate read {} not found", job.plate_read_id),
                    status_code: None,
                };
                self.record_failure(&job, &failure, summary).await;
                return;
            }
            Err(e) => {
                // The lease runs out and the job is reclaimed later.
                tracing::error!(job_id = job.id, error = %e, "Failed to load job detail");
                return;
            }
        };

        let hits = build_hit_document(&detail, self.ctx.presigner.as_ref()).await;

        let started = Instant::now();
        let sent = self.ctx.sender.send(&hits, self.settings.send_timeout).await;
        metrics::histogram!("alert_delivery_seconds").record(started.elapsed().as_secs_f64());

        match sent {
            Ok(status_code) => {
                summary.delivered += 1;
                metrics::counter!("alert_deliveries_total").increment(1);
                tracing::info!(
                    job_id = job.id,
                    plate_read_id = job.plate_read_id,
                    hotlist_id = job.hotlist_id,
                    status_code,
                    "Plate hit delivered"
                );
                if let Err(e) = self
                    .ctx
                    .store
                    .schedule_success(job.id, &self.settings.worker_id, status_code)
                    .await
                {
                    tracing::error!(job_id = job.id, error = %e, "Failed to record delivery success");
                }
            }
            Err(e) => {
                let failure = JobFailure {
                    message: e.to_string(),
                    status_code: e.status_code(),
                };
                self.record_failure(&job, &failure, summary).await;
            }
        }
    }

    async fn record_failure(&self, job: &ClaimedJob, failure: &JobFailure, summary: &mut DrainSummary) {
        summary.failed += 1;
        metrics::counter!("alert_delivery_failures_total").increment(1);

        match self
            .ctx
            .store
            .schedule_failure(job.id, &self.settings.worker_id, failure)
            .await
        {
            Ok(outcome) if outcome.status == JobStatus::Dead => {
                summary.dead += 1;
                metrics::counter!("alert_jobs_dead_total").increment(1);
                tracing::error!(
                    job_id = job.id,
                    attempts = outcome.attempts,
                    error = %failure.message,
                    "Plate hit dead-lettered after final attempt"
                );
            }
            Ok(outcome) => {
                tracing::warn!(
                    job_id = job.id,
                    attempts = outcome.attempts,
                    status_code = ?failure.status_code,
                    next_attempt_at = %outcome.next_eligible_at,
                    error = %failure.message,
                    "Plate hit delivery failed, will retry"
                );
            }
            Err(StoreError::NotClaimed(_)) => {
                tracing::warn!(job_id = job.id, "Lease lost before failure was recorded");
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to record delivery failure");
            }
        }
    }

    async fn release(&self, job_id: i64, summary: &mut DrainSummary) {
        match self.ctx.store.release_claim(job_id, &self.settings.worker_id).await {
            Ok(()) => summary.released += 1,
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to release claim on shutdown"),
        }
    }

    /// How long to stay idle, from the store's next wake time.
    pub async fn sleep_duration(&self, ceiling: Duration) -> Duration {
        match self.ctx.store.next_wake().await {
            Ok(next_wake) => sleep_for(next_wake, Utc::now(), self.settings.min_sleep, ceiling),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read next wake time, using fallback delay");
                clamp_sleep(self.settings.fallback_delay, self.settings.min_sleep, ceiling)
            }
        }
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "Dispatcher state change");
            self.state = next;
        }
    }
}

/// Time until `next_wake`, clamped to `[floor, ceiling]`.
pub fn sleep_for(
    next_wake: DateTime<Utc>,
    now: DateTime<Utc>,
    floor: Duration,
    ceiling: Duration,
) -> Duration {
    let until = next_wake
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    clamp_sleep(until, floor, ceiling)
}

fn clamp_sleep(wait: Duration, floor: Duration, ceiling: Duration) -> Duration {
    wait.min(ceiling).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::far_future;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    const FLOOR: Duration = Duration::from_millis(250);
    const CEILING: Duration = Duration::from_secs(30);

    #[test]
    fn test_sleep_until_next_wake() {
        let wake = now() + chrono::Duration::seconds(4);
        assert_eq!(sleep_for(wake, now(), FLOOR, CEILING), Duration::from_secs(4));
    }

    #[test]
    fn test_sleep_floor_for_overdue_work() {
        let wake = now() - chrono::Duration::seconds(10);
        assert_eq!(sleep_for(wake, now(), FLOOR, CEILING), FLOOR);
    }

    #[test]
    fn test_sleep_ceiling_when_queue_empty() {
        assert_eq!(sleep_for(far_future(), now(), FLOOR, CEILING), CEILING);
    }

    #[test]
    fn test_floor_wins_over_small_ceiling() {
        assert_eq!(clamp_sleep(Duration::ZERO, FLOOR, Duration::from_millis(10)), FLOOR);
    }

    #[test]
    fn test_miss_after() {
        let push = PushSettings {
            heartbeat: Duration::from_secs(30),
            miss_factor: 3,
            resubscribe_base: Duration::from_millis(500),
            resubscribe_cap: Duration::from_secs(30),
            resubscribe_attempts: 6,
        };
        assert_eq!(push.miss_after(), Duration::from_secs(90));
    }
}
