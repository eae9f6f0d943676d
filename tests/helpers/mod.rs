//! In-memory collaborators for exercising the dispatcher without Postgres, S3 or a
//! live receiver.
#![allow(dead_code)]

use alpr_alerts::{
    db::store::{far_future, JobStore, PushSource, StoreError, WakeEvent, WakeSubscription},
    models::hit::PlateHits,
    models::job::{ClaimedJob, FailureOutcome, JobDetail, JobFailure, JobStatus},
    services::{
        backoff::RetryPolicy,
        delivery::{ApiError, DeliveryError, Sender},
        dispatcher::{DispatchContext, DispatchSettings},
        storage::{Presigner, StorageError},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Snapshot of one queued job.
#[derive(Debug, Clone)]
pub struct MemJob {
    pub id: i64,
    pub plate_read_id: i64,
    pub hotlist_id: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_status_code: Option<u16>,
}

struct Inner {
    jobs: BTreeMap<i64, MemJob>,
    details: HashMap<i64, JobDetail>,
    clock_offset: chrono::Duration,
    claim_calls: u32,
}

/// Queue with the same claim/lease/retry semantics as the Postgres store, and a
/// clock tests can move forward.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
    lease: chrono::Duration,
    pub fail_claims: AtomicBool,
    pub fail_next_wake: AtomicBool,
}

impl MemoryStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: BTreeMap::new(),
                details: HashMap::new(),
                clock_offset: chrono::Duration::zero(),
                claim_calls: 0,
            }),
            retry,
            lease: chrono::Duration::seconds(120),
            fail_claims: AtomicBool::new(false),
            fail_next_wake: AtomicBool::new(false),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = chrono::Duration::from_std(lease).unwrap();
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.inner.lock().unwrap().clock_offset
    }

    /// Move the store clock just past `t`.
    pub fn advance_to(&self, t: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now() + inner.clock_offset;
        if t >= now {
            inner.clock_offset = inner.clock_offset + (t - now) + chrono::Duration::milliseconds(1);
        }
    }

    /// Enqueue a PENDING job, due now unless `due_in` says otherwise.
    pub fn insert(&self, detail: JobDetail, plate_read_id: i64, due_in: chrono::Duration) {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        let id = detail.job_id;
        inner.jobs.insert(
            id,
            MemJob {
                id,
                plate_read_id,
                hotlist_id: 1,
                status: JobStatus::Pending,
                attempts: 0,
                next_eligible_at: now + due_in,
                lease_owner: None,
                lease_expires_at: None,
                last_error: None,
                last_status_code: None,
            },
        );
        inner.details.insert(id, detail);
    }

    /// Enqueue a job whose reference rows are missing.
    pub fn insert_orphan(&self, job_id: i64, plate_read_id: i64) {
        let now = self.now();
        self.inner.lock().unwrap().jobs.insert(
            job_id,
            MemJob {
                id: job_id,
                plate_read_id,
                hotlist_id: 1,
                status: JobStatus::Pending,
                attempts: 0,
                next_eligible_at: now,
                lease_owner: None,
                lease_expires_at: None,
                last_error: None,
                last_status_code: None,
            },
        );
    }

    pub fn job(&self, id: i64) -> MemJob {
        self.inner.lock().unwrap().jobs[&id].clone()
    }

    pub fn claim_calls(&self) -> u32 {
        self.inner.lock().unwrap().claim_calls
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn claim_due(
        &self,
        batch_size: u32,
        worker_id: &str,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("claim failed (injected)".to_string()));
        }

        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        inner.claim_calls += 1;

        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .jobs
            .values()
            .filter(|j| match j.status {
                JobStatus::Pending | JobStatus::FailedRetryable => j.next_eligible_at <= now,
                JobStatus::Claimed => j.lease_expires_at.map_or(false, |t| t <= now),
                _ => false,
            })
            .map(|j| (j.next_eligible_at, j.id))
            .collect();
        due.sort();
        due.truncate(batch_size as usize);

        let lease_expires_at = now + self.lease;
        Ok(due
            .into_iter()
            .map(|(_, id)| {
                let job = inner.jobs.get_mut(&id).unwrap();
                job.status = JobStatus::Claimed;
                job.lease_owner = Some(worker_id.to_string());
                job.lease_expires_at = Some(lease_expires_at);
                ClaimedJob {
                    id,
                    plate_read_id: job.plate_read_id,
                    hotlist_id: job.hotlist_id,
                    attempts: job.attempts,
                    next_eligible_at: job.next_eligible_at,
                    lease_expires_at,
                }
            })
            .collect())
    }

    async fn schedule_success(
        &self,
        job_id: i64,
        worker_id: &str,
        status_code: u16,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if held_by(job, worker_id) {
                job.status = JobStatus::Succeeded;
                job.last_status_code = Some(status_code);
                job.last_error = None;
                job.lease_owner = None;
                job.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn schedule_failure(
        &self,
        job_id: i64,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .filter(|j| held_by(j, worker_id))
            .ok_or(StoreError::NotClaimed(job_id))?;

        job.attempts += 1;
        job.last_error = Some(failure.message.clone());
        job.last_status_code = failure.status_code;
        job.lease_owner = None;
        job.lease_expires_at = None;
        if self.retry.is_exhausted(job.attempts) {
            job.status = JobStatus::Dead;
        } else {
            let delay = self.retry.delay_for(job.attempts as u32);
            job.status = JobStatus::FailedRetryable;
            job.next_eligible_at = job.next_eligible_at.max(now)
                + chrono::Duration::from_std(delay).unwrap();
        }

        Ok(FailureOutcome {
            status: job.status,
            attempts: job.attempts,
            next_eligible_at: job.next_eligible_at,
        })
    }

    async fn release_claim(&self, job_id: i64, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if held_by(job, worker_id) {
                job.status = if job.attempts > 0 {
                    JobStatus::FailedRetryable
                } else {
                    JobStatus::Pending
                };
                job.lease_owner = None;
                job.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn next_wake(&self) -> Result<DateTime<Utc>, StoreError> {
        if self.fail_next_wake.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("next wake failed (injected)".to_string()));
        }
        let inner = self.inner.lock().unwrap();
        let offset = inner.clock_offset;
        Ok(inner
            .jobs
            .values()
            .filter_map(|j| match j.status {
                JobStatus::Pending | JobStatus::FailedRetryable => Some(j.next_eligible_at),
                JobStatus::Claimed => j.lease_expires_at,
                _ => None,
            })
            .min()
            // reported on the real clock the dispatcher compares against
            .map(|t| t - offset)
            .unwrap_or_else(far_future))
    }

    async fn get_job_detail(&self, job_id: i64) -> Result<Option<JobDetail>, StoreError> {
        Ok(self.inner.lock().unwrap().details.get(&job_id).cloned())
    }
}

fn held_by(job: &MemJob, worker_id: &str) -> bool {
    job.status == JobStatus::Claimed && job.lease_owner.as_deref() == Some(worker_id)
}

/// Push channel double. Subscriptions can be made to fail, and heartbeats are
/// echoed back only when `echo_heartbeats` is set.
pub struct MemoryPush {
    pub failures_before_success: AtomicU32,
    pub echo_heartbeats: AtomicBool,
    subscribe_calls: AtomicU32,
    heartbeats: AtomicU32,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WakeEvent>>>,
}

impl MemoryPush {
    pub fn new() -> Self {
        Self {
            failures_before_success: AtomicU32::new(0),
            echo_heartbeats: AtomicBool::new(true),
            subscribe_calls: AtomicU32::new(0),
            heartbeats: AtomicU32::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        let push = Self::new();
        push.failures_before_success.store(u32::MAX, Ordering::SeqCst);
        push
    }

    pub fn notify(&self, event: WakeEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Close every open subscription, as a dropped LISTEN connection would.
    pub fn disconnect_all(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> u32 {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<WakeEvent>,
}

#[async_trait]
impl WakeSubscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<WakeEvent>, StoreError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl PushSource for MemoryPush {
    async fn subscribe(&self) -> Result<Box<dyn WakeSubscription>, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(StoreError::Corrupt("listen failed (injected)".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(Box::new(MemorySubscription { rx }))
    }

    async fn heartbeat(&self) -> Result<(), StoreError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.echo_heartbeats.load(Ordering::SeqCst) {
            self.notify(WakeEvent::Heartbeat);
        }
        Ok(())
    }
}

/// Presigner returning predictable links.
pub struct StaticPresigner;

#[async_trait]
impl Presigner for StaticPresigner {
    async fn presign_get(&self, key: &str, _expiry: Duration) -> Result<String, StorageError> {
        Ok(format!("https://images.test/{}?X-Amz-Signature=fake", key))
    }
}

/// Sender that records every document and answers from a fixed script.
pub struct RecordingSender {
    reject: Option<(u16, String)>,
    cancel_on_send: Option<CancellationToken>,
    sent: Mutex<Vec<PlateHits>>,
}

impl RecordingSender {
    pub fn accepting() -> Self {
        Self {
            reject: None,
            cancel_on_send: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(status: u16, body: &str) -> Self {
        Self {
            reject: Some((status, body.to_string())),
            ..Self::accepting()
        }
    }

    /// Accepts, and fires `cancel` during the first send.
    pub fn cancelling(cancel: CancellationToken) -> Self {
        Self {
            cancel_on_send: Some(cancel),
            ..Self::accepting()
        }
    }

    pub fn sent(&self) -> Vec<PlateHits> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, hits: &PlateHits, _timeout: Duration) -> Result<u16, DeliveryError> {
        self.sent.lock().unwrap().push(hits.clone());
        if let Some(cancel) = &self.cancel_on_send {
            cancel.cancel();
        }
        match &self.reject {
            Some((status, body)) => {
                let status = StatusCode::from_u16(*status).unwrap();
                Err(DeliveryError::Rejected(ApiError::from_response(status, body)))
            }
            None => Ok(200),
        }
    }
}

pub fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(60))
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        worker_id: "worker-test".to_string(),
        batch_size: 10,
        send_timeout: Duration::from_secs(5),
        min_sleep: Duration::from_millis(5),
        fallback_delay: Duration::from_millis(500),
    }
}

pub fn context(store: Arc<MemoryStore>, sender: Arc<dyn Sender>) -> DispatchContext {
    DispatchContext {
        store,
        presigner: Arc::new(StaticPresigner),
        sender,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
