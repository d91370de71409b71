//! Submission endpoints: table ingestion and bucket uploads.
//!
//! Each returns as soon as the job is queued: 201 with the new job, or 200
//! pointing at the earlier job when the content was already ingested.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use sheetload::{IngestResponse, JobRecord, SheetloadError};

use super::run_blocking;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FromStorageRequest {
    pub s3_key: String,
}

/// POST /ingest/database
pub async fn ingest_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content = field.bytes().await?.to_vec();
        upload = Some((filename, content));
        break;
    }

    let (filename, content) =
        upload.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;

    let result = run_blocking(&state.service, move |service| {
        service.submit_upload(&filename, content)
    })
    .await?;
    submission_response(result)
}

/// POST /ingest/database/from-s3
pub async fn ingest_from_storage(
    State(state): State<AppState>,
    Json(request): Json<FromStorageRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    if request.s3_key.trim().is_empty() {
        return Err(ApiError::BadRequest("s3_key is required".to_string()));
    }

    let result = run_blocking(&state.service, move |service| {
        service.submit_from_storage(&request.s3_key)
    })
    .await?;
    submission_response(result)
}

/// POST /upload/s3
///
/// Takes any number of `files` (or `files[]`) parts and an optional
/// `preserve_filename` flag, which defaults to true.
pub async fn upload_to_storage(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let mut files = Vec::new();
    let mut preserve_filename = true;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("files") | Some("files[]") | Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content = field.bytes().await?.to_vec();
                files.push((filename, content));
            }
            Some("preserve_filename") => {
                let value = field.text().await?;
                preserve_filename = parse_flag(&value).ok_or_else(|| {
                    ApiError::BadRequest(format!("Invalid preserve_filename: {}", value))
                })?;
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one file must be provided".to_string(),
        ));
    }

    let result = run_blocking(&state.service, move |service| {
        service.upload_to_storage(files, preserve_filename)
    })
    .await?;
    submission_response(result)
}

fn submission_response(
    result: sheetload::Result<JobRecord>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    match result {
        Ok(job) => Ok((StatusCode::CREATED, Json(IngestResponse::accepted(&job)))),
        Err(SheetloadError::Duplicate(existing)) => {
            Ok((StatusCode::OK, Json(IngestResponse::duplicate(&existing))))
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/ingest/database", post(ingest_upload))
        .route("/ingest/database/from-s3", post(ingest_from_storage))
        .route("/upload/s3", post(upload_to_storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag(" False "), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
