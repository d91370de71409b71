//! Analytics rebuild endpoint.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sheetload::{AnalyticsSummary, JobStatus};

use super::run_blocking;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BuildParams {
    /// `sync` (default) or `async`.
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BuildCompleted {
    pub status: String,
    pub message: String,
    #[serde(flatten)]
    pub summary: AnalyticsSummary,
}

#[derive(Debug, Serialize)]
pub struct BuildQueued {
    pub task_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// POST /analytics/build?mode=sync|async
///
/// Sync runs the rebuild before answering. Async queues an analytics job and
/// answers 202 with its id, which `/status/:job_id` then tracks.
pub async fn build_analytics(
    State(state): State<AppState>,
    Query(params): Query<BuildParams>,
) -> ApiResult<Response> {
    match params.mode.as_deref().unwrap_or("sync") {
        "sync" => {
            let summary =
                run_blocking(&state.service, |service| service.build_analytics_sync()).await??;
            let message = format!(
                "Analytics built from {} table(s)",
                summary.tables_processed.len()
            );
            Ok(Json(BuildCompleted {
                status: "completed".to_string(),
                message,
                summary,
            })
            .into_response())
        }
        "async" => {
            let job =
                run_blocking(&state.service, |service| service.build_analytics_async()).await??;
            let body = BuildQueued {
                task_id: job.id,
                status: job.status,
                message: job.message.unwrap_or_default(),
            };
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        other => Err(ApiError::BadRequest(format!(
            "Unknown mode '{}', expected sync or async",
            other
        ))),
    }
}

pub fn analytics_routes() -> Router<AppState> {
    Router::new().route("/analytics/build", post(build_analytics))
}
