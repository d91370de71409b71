//! HTTP handlers.
//!
//! Service calls touch SQLite and the bucket directory, so every handler
//! hands them to the blocking pool through [`run_blocking`].

pub mod analytics;
pub mod health;
pub mod ingest;
pub mod jobs;
pub mod tables;

pub use analytics::analytics_routes;
pub use health::health_routes;
pub use ingest::ingest_routes;
pub use jobs::job_routes;
pub use tables::table_routes;

use std::sync::Arc;

use sheetload::IngestService;

use crate::error::ApiResult;

/// Runs a service call on the blocking pool.
///
/// The outer result covers the blocking task itself; the inner one is the
/// service's own result, left intact so callers can special-case variants
/// such as duplicates.
pub(crate) async fn run_blocking<F, T>(
    service: &Arc<IngestService>,
    f: F,
) -> ApiResult<sheetload::Result<T>>
where
    F: FnOnce(&IngestService) -> sheetload::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let service = Arc::clone(service);
    Ok(tokio::task::spawn_blocking(move || f(&service)).await?)
}
