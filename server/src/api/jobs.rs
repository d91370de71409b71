//! Job status, listing and deletion.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sheetload::{
    IngestionType, JobFilter, JobOrdering, JobPage, JobRecord, JobStatus, StatusResponse,
};

use super::run_blocking;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Query parameters accepted by `GET /jobs`.
#[derive(Debug, Default, Deserialize)]
pub struct JobListParams {
    pub status: Option<String>,
    pub ingestion_type: Option<String>,
    pub file_hash: Option<String>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl JobListParams {
    fn into_filter(self) -> ApiResult<JobFilter> {
        let status = self
            .status
            .map(|s| {
                JobStatus::parse(&s)
                    .ok_or_else(|| ApiError::BadRequest(format!("Unknown status: {}", s)))
            })
            .transpose()?;
        let ingestion_type = self
            .ingestion_type
            .map(|t| {
                IngestionType::parse(&t)
                    .ok_or_else(|| ApiError::BadRequest(format!("Unknown ingestion_type: {}", t)))
            })
            .transpose()?;
        let ordering = match self.ordering {
            Some(o) => JobOrdering::parse(&o)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown ordering: {}", o)))?,
            None => JobOrdering::default(),
        };

        Ok(JobFilter {
            status,
            ingestion_type,
            file_hash: self.file_hash.filter(|h| !h.is_empty()),
            search: self.search.filter(|s| !s.is_empty()),
            ordering,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub job_id: String,
    pub status: String,
}

/// GET /status/:job_id
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let status = run_blocking(&state.service, move |service| service.job_status(&job_id)).await??;
    Ok(Json(status))
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Json<JobPage>> {
    let filter = params.into_filter()?;
    let page = run_blocking(&state.service, move |service| service.list_jobs(&filter)).await??;
    Ok(Json(page))
}

/// GET /jobs/:job_id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    let job = run_blocking(&state.service, move |service| service.get_job(&job_id)).await??;
    Ok(Json(job))
}

/// DELETE /jobs/:job_id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let id = job_id.clone();
    run_blocking(&state.service, move |service| service.delete_job(&id)).await??;

    Ok(Json(DeleteResponse {
        message: format!("Job {} deleted", job_id),
        job_id,
        status: "deleted".to_string(),
    }))
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/status/:job_id", get(job_status))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_into_filter() {
        let params = JobListParams {
            status: Some("completed".into()),
            ingestion_type: Some("s3-upload".into()),
            ordering: Some("created_at".into()),
            search: Some(String::new()),
            limit: Some(10),
            ..Default::default()
        };
        let filter = params.into_filter().unwrap();
        assert_eq!(filter.status, Some(JobStatus::Completed));
        assert_eq!(filter.ingestion_type, Some(IngestionType::S3Upload));
        assert_eq!(filter.ordering, JobOrdering::OldestFirst);
        assert_eq!(filter.search, None);
        assert_eq!(filter.limit, Some(10));
    }

    #[test]
    fn test_unknown_status_is_bad_request() {
        let params = JobListParams {
            status: Some("sleeping".into()),
            ..Default::default()
        };
        assert!(matches!(params.into_filter(), Err(ApiError::BadRequest(_))));
    }
}
