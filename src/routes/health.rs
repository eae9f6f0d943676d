use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db::queries;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// Jobs that are claimable right now. A backlog that keeps growing means no
/// dispatcher is draining.
#[derive(Serialize)]
pub struct QueueHealth {
    pub due_jobs: Option<i64>,
    pub oldest_due_secs: Option<i64>,
}

/// GET /health — database reachability and alert backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let (database, queue) = match queries::due_backlog(&state.db).await {
        Ok(backlog) => (
            ComponentHealth {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            QueueHealth {
                due_jobs: Some(backlog.due_jobs),
                oldest_due_secs: backlog.oldest_due_secs,
            },
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach database");
            (
                ComponentHealth {
                    status: "error".to_string(),
                    latency_ms: None,
                },
                QueueHealth {
                    due_jobs: None,
                    oldest_due_secs: None,
                },
            )
        }
    };

    let healthy = database.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { database, queue },
    };

    (status_code, Json(response))
}
