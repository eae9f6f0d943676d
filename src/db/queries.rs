use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

use crate::db::store::{far_future, JobStore, StoreError};
use crate::models::job::{
    AlertJob, ClaimedJob, FailureOutcome, JobDetail, JobFailure, JobStatus,
};
use crate::services::backoff::RetryPolicy;

/// Postgres-backed alert queue.
#[derive(Clone)]
pub struct PgJobStore {
    pub(crate) pool: PgPool,
    retry: RetryPolicy,
    lease: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, retry: RetryPolicy, lease: Duration) -> Self {
        Self { pool, retry, lease }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_due(
        &self,
        batch_size: u32,
        worker_id: &str,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        // SKIP LOCKED keeps concurrent claimers from ever seeing the same row.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM alert_jobs
                WHERE (status IN ('PENDING', 'FAILED_RETRYABLE') AND next_eligible_at <= NOW())
                   OR (status = 'CLAIMED' AND lease_expires_at <= NOW())
                ORDER BY next_eligible_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE alert_jobs j
            SET status = 'CLAIMED',
                lease_owner = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            FROM due
            WHERE j.id = due.id
            RETURNING j.id, j.plate_read_id, j.hotlist_id, j.attempts,
                      j.next_eligible_at, j.lease_expires_at
            "#,
        )
        .bind(i64::from(batch_size))
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .iter()
            .map(|r| -> Result<ClaimedJob, sqlx::Error> {
                Ok(ClaimedJob {
                    id: r.try_get("id")?,
                    plate_read_id: r.try_get("plate_read_id")?,
                    hotlist_id: r.try_get("hotlist_id")?,
                    attempts: r.try_get("attempts")?,
                    next_eligible_at: r.try_get("next_eligible_at")?,
                    lease_expires_at: r.try_get("lease_expires_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // UPDATE .. RETURNING does not preserve the CTE ordering.
        jobs.sort_by_key(|j| (j.next_eligible_at, j.id));
        Ok(jobs)
    }

    async fn schedule_success(
        &self,
        job_id: i64,
        worker_id: &str,
        status_code: u16,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_jobs
            SET status = 'SUCCEEDED',
                last_status_code = $2,
                last_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'CLAIMED' AND lease_owner = $3
            "#,
        )
        .bind(job_id)
        .bind(i32::from(status_code))
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(job_id, worker_id, "Success not recorded, job no longer held");
        }
        Ok(())
    }

    async fn schedule_failure(
        &self,
        job_id: i64,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, attempts, lease_owner FROM alert_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotClaimed(job_id))?;

        let status: String = row.try_get("status")?;
        let owner: Option<String> = row.try_get("lease_owner")?;
        if parse_status(&status)? != JobStatus::Claimed || owner.as_deref() != Some(worker_id) {
            return Err(StoreError::NotClaimed(job_id));
        }

        let attempts: i32 = row.try_get::<i32, _>("attempts")? + 1;
        let (status, delay) = if self.retry.is_exhausted(attempts) {
            (JobStatus::Dead, Duration::ZERO)
        } else {
            (
                JobStatus::FailedRetryable,
                self.retry.delay_for(attempts as u32),
            )
        };

        let row = sqlx::query(
            r#"
            UPDATE alert_jobs
            SET status = $2,
                attempts = $3,
                last_error = $4,
                last_status_code = $5,
                next_eligible_at = CASE
                    WHEN $2 = 'DEAD' THEN next_eligible_at
                    ELSE GREATEST(NOW(), next_eligible_at) + make_interval(secs => $6)
                END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING next_eligible_at
            "#,
        )
        .bind(job_id)
        .bind(status.as_ref())
        .bind(attempts)
        .bind(&failure.message)
        .bind(failure.status_code.map(i32::from))
        .bind(delay.as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;

        let next_eligible_at: DateTime<Utc> = row.try_get("next_eligible_at")?;
        tx.commit().await?;

        Ok(FailureOutcome {
            status,
            attempts,
            next_eligible_at,
        })
    }

    async fn release_claim(&self, job_id: i64, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE alert_jobs
            SET status = CASE WHEN attempts > 0 THEN 'FAILED_RETRYABLE' ELSE 'PENDING' END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'CLAIMED' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn next_wake(&self) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(CASE WHEN status = 'CLAIMED' THEN lease_expires_at ELSE next_eligible_at END) AS wake_at
            FROM alert_jobs
            WHERE status IN ('PENDING', 'FAILED_RETRYABLE', 'CLAIMED')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let wake_at: Option<DateTime<Utc>> = row.try_get("wake_at")?;
        Ok(wake_at.unwrap_or_else(far_future))
    }

    async fn get_job_detail(&self, job_id: i64) -> Result<Option<JobDetail>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT j.id AS job_id, r.read_uid, r.event_id, r.event_time,
                   r.plate_number, r.plate_state, r.plate_number2, r.confidence,
                   r.vehicle_make, r.vehicle_model, r.vehicle_color, r.vehicle_size, r.vehicle_type,
                   r.camera_id, c.camera_name, c.camera_type, c.agency, c.ori,
                   r.latitude, r.longitude, r.direction,
                   r.additional_image1, r.additional_image2,
                   r.source_id, r.image_id, r.read_id
            FROM alert_jobs j
            JOIN plate_reads r ON r.id = j.plate_read_id
            LEFT JOIN cameras c ON c.camera_id = r.camera_id
            WHERE j.id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(detail_from_row).transpose()?)
    }
}

fn detail_from_row(r: &PgRow) -> Result<JobDetail, sqlx::Error> {
    Ok(JobDetail {
        job_id: r.try_get("job_id")?,
        read_uid: r.try_get("read_uid")?,
        event_id: r.try_get("event_id")?,
        event_time: r.try_get("event_time")?,
        plate_number: r.try_get("plate_number")?,
        plate_state: r.try_get("plate_state")?,
        plate_number2: r.try_get("plate_number2")?,
        confidence: r.try_get("confidence")?,
        vehicle_make: r.try_get("vehicle_make")?,
        vehicle_model: r.try_get("vehicle_model")?,
        vehicle_color: r.try_get("vehicle_color")?,
        vehicle_size: r.try_get("vehicle_size")?,
        vehicle_type: r.try_get("vehicle_type")?,
        camera_id: r.try_get("camera_id")?,
        camera_name: r.try_get("camera_name")?,
        camera_type: r.try_get("camera_type")?,
        agency: r.try_get("agency")?,
        ori: r.try_get("ori")?,
        latitude: r.try_get("latitude")?,
        longitude: r.try_get("longitude")?,
        direction: r.try_get("direction")?,
        additional_image1: r.try_get("additional_image1")?,
        additional_image2: r.try_get("additional_image2")?,
        source_id: r.try_get("source_id")?,
        image_id: r.try_get("image_id")?,
        read_id: r.try_get("read_id")?,
    })
}

fn parse_status(s: &str) -> Result<JobStatus, StoreError> {
    JobStatus::from_str(s).map_err(|_| StoreError::Corrupt(format!("unknown job status {:?}", s)))
}

/// Get a job row by ID, for diagnosis.
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<AlertJob>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, plate_read_id, hotlist_id, status, attempts, next_eligible_at,
               lease_owner, lease_expires_at, last_error, last_status_code,
               created_at, updated_at
        FROM alert_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let status: String = r.try_get("status")?;
    Ok(Some(AlertJob {
        id: r.try_get("id")?,
        plate_read_id: r.try_get("plate_read_id")?,
        hotlist_id: r.try_get("hotlist_id")?,
        status: parse_status(&status)?,
        attempts: r.try_get("attempts")?,
        next_eligible_at: r.try_get("next_eligible_at")?,
        lease_owner: r.try_get("lease_owner")?,
        lease_expires_at: r.try_get("lease_expires_at")?,
        last_error: r.try_get("last_error")?,
        last_status_code: r.try_get("last_status_code")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    }))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: i64,
}

/// Number of jobs per status.
pub async fn status_counts(pool: &PgPool) -> Result<Vec<StatusCount>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS count
        FROM alert_jobs
        GROUP BY status
        ORDER BY status
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| -> Result<StatusCount, StoreError> {
            let status: String = r.try_get("status")?;
            Ok(StatusCount {
                status: parse_status(&status)?,
                count: r.try_get("count")?,
            })
        })
        .collect()
}

/// Claimable-now backlog, for the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DueBacklog {
    pub due_jobs: i64,
    pub oldest_due_secs: Option<i64>,
}

pub async fn due_backlog(pool: &PgPool) -> Result<DueBacklog, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS due_jobs,
               EXTRACT(EPOCH FROM NOW() - MIN(next_eligible_at))::BIGINT AS oldest_due_secs
        FROM alert_jobs
        WHERE status IN ('PENDING', 'FAILED_RETRYABLE') AND next_eligible_at <= NOW()
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DueBacklog {
        due_jobs: row.try_get("due_jobs")?,
        oldest_due_secs: row.try_get("oldest_due_secs")?,
    })
}
