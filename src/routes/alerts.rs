use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::db::queries::{self, StatusCount};
use crate::models::job::AlertJob;

/// GET /api/v1/alerts/{job_id} — status, attempts and last error of one job.
pub async fn get_alert_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<AlertJob>, StatusCode> {
    match queries::get_job(&state.db, job_id).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Failed to load alert job");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/v1/alerts/stats — number of jobs per status.
pub async fn alert_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<StatusCount>>, StatusCode> {
    queries::status_counts(&state.db).await.map(Json).map_err(|e| {
        tracing::error!(error = %e, "Failed to count alert jobs");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
