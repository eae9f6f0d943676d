use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle status of an alert job in the `alert_jobs` queue.
///
/// Stored as SCREAMING_SNAKE_CASE text, e.g. `FAILED_RETRYABLE`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Claimed,
    Succeeded,
    FailedRetryable,
    Dead,
}

impl JobStatus {
    /// Terminal rows are kept for audit and never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }
}

/// A job as handed out by `claim_due`, holding an active lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: i64,
    pub plate_read_id: i64,
    pub hotlist_id: i64,
    pub attempts: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Full job row, used for operational diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertJob {
    pub id: i64,
    pub plate_read_id: i64,
    pub hotlist_id: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a delivery attempt failed, as recorded on the job row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub message: String,
    pub status_code: Option<u16>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub status: JobStatus,
    pub attempts: i32,
    pub next_eligible_at: DateTime<Utc>,
}

/// Joined read/camera/vehicle fields needed to build a hit document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetail {
    pub job_id: i64,
    pub read_uid: String,
    pub event_id: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub plate_number: Option<String>,
    pub plate_state: Option<String>,
    pub plate_number2: Option<String>,
    pub confidence: Option<String>,
    pub vehicle_make: Option<String>,
    pub vehicle_model: Option<String>,
    pub vehicle_color: Option<String>,
    pub vehicle_size: Option<String>,
    pub vehicle_type: Option<String>,
    pub camera_id: Option<String>,
    pub camera_name: Option<String>,
    pub camera_type: Option<String>,
    pub agency: Option<String>,
    pub ori: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub direction: Option<String>,
    pub additional_image1: Option<String>,
    pub additional_image2: Option<String>,
    pub source_id: Option<String>,
    pub image_id: Option<String>,
    pub read_id: Option<String>,
}
