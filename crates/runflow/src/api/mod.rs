use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::api::models::{CancelResponse, SubmitRequest, SubmitResponse};
use crate::error::EngineError;
use crate::jobs::{JobsRepo, RunParams, StatusCounts};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/runs", post(submit_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/log", get(get_run_log))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn internal_err(e: EngineError) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn submit_err(e: EngineError) -> (StatusCode, String) {
    match &e {
        EngineError::Conflict { .. } => (StatusCode::CONFLICT, e.to_string()),
        EngineError::BadParams(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => internal_err(e),
    }
}

pub async fn submit_run(
    State(state): State<ApiState>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    let SubmitRequest { job_type, params } = body;

    if job_type.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "job_type is required".into()));
    }

    let run_params = RunParams::from_value(&params).map_err(submit_err)?;

    // Advisory pre-check; the store's unique index closes the race window
    // and an enqueue that loses it reports the same conflict.
    if state
        .jobs
        .exists_active(&job_type, &run_params.period, &run_params.q)
        .await
        .map_err(internal_err)?
    {
        let conflict = EngineError::Conflict {
            job_type,
            period: run_params.period,
            q: run_params.q,
        };
        return Err((StatusCode::CONFLICT, conflict.to_string()));
    }

    let job_id = state
        .jobs
        .enqueue(&job_type, &run_params, params)
        .await
        .map_err(submit_err)?;

    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

pub async fn get_run(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.jobs.find(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "run not found".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("internal error: {e}"),
            }),
        )
            .into_response(),
    }
}

/// Raw text of the run's log file. The file is opened shared-read, so a
/// still-running job's log can be fetched mid-flight.
pub async fn get_run_log(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let job = state
        .jobs
        .find(id)
        .await
        .map_err(internal_err)?
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;

    let log_path = job.log_path.ok_or((
        StatusCode::NOT_FOUND,
        "no log recorded for this run yet".to_string(),
    ))?;

    let contents = tokio::fs::read_to_string(&log_path).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not read log {log_path}: {e}"),
        )
    })?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        contents,
    ))
}

/// Request cancellation. Acknowledged asynchronously: a queued job will
/// never start, a running job keeps its process until the runner finishes
/// or times out, but its record is terminal from this point on.
pub async fn cancel_run(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Result<(StatusCode, Json<CancelResponse>), (StatusCode, String)> {
    state
        .jobs
        .find(id)
        .await
        .map_err(internal_err)?
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;

    let canceled = state.jobs.cancel(id).await.map_err(internal_err)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: id,
            canceled,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub jobs: StatusCounts,
}

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let jobs = state.jobs.counts_by_status().await.map_err(internal_err)?;

    Ok(Json(MetricsResponse {
        now_utc: Utc::now(),
        jobs,
    }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
