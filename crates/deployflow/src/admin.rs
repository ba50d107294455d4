//! Read-only operator endpoints: queue inspection, deployment logs, health.

use crate::events::DeploymentLogEntry;
use crate::jobs::{Job, JobCounts, JobQueue, JobStatus};
use crate::store::{Store, StoreError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn Store>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/deployments/:id/logs", get(deployment_logs))
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn internal_err(e: StoreError) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("internal error: {e}"),
        }),
    )
}

fn not_found(what: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("{what} not found"),
        }),
    )
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<Job>,
}

pub async fn list_jobs(
    State(state): State<AdminState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, (StatusCode, Json<ErrorBody>)> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(JobStatus::parse(s).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("unknown status {s:?}"),
                }),
            )
        })?),
    };
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);

    let items = state
        .queue
        .list_jobs(status, limit)
        .await
        .map_err(internal_err)?;
    Ok(Json(ListJobsResponse { items }))
}

pub async fn get_job(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorBody>)> {
    state
        .queue
        .get_job(id)
        .await
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("job"))
}

pub async fn deployment_logs(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeploymentLogEntry>>, (StatusCode, Json<ErrorBody>)> {
    if state
        .store
        .get_deployment(id)
        .await
        .map_err(internal_err)?
        .is_none()
    {
        return Err(not_found("deployment"));
    }
    let logs = state.store.list_logs(id).await.map_err(internal_err)?;
    Ok(Json(logs))
}

pub async fn metrics(
    State(state): State<AdminState>,
) -> Result<Json<JobCounts>, (StatusCode, Json<ErrorBody>)> {
    let counts = state.queue.counts().await.map_err(internal_err)?;
    Ok(Json(counts))
}

pub async fn metrics_prom(State(state): State<AdminState>) -> Response {
    match state.queue.counts().await {
        Ok(c) => {
            let mut body = String::from(
                "# HELP deployflow_jobs Number of jobs by status\n# TYPE deployflow_jobs gauge\n",
            );
            for (status, n) in [
                ("pending", c.pending),
                ("processing", c.processing),
                ("completed", c.completed),
                ("failed", c.failed),
            ] {
                body.push_str(&format!("deployflow_jobs{{status=\"{status}\"}} {n}\n"));
            }
            (StatusCode::OK, body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}
