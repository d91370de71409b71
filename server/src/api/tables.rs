//! Read-only access to loaded tables.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use sheetload::{TableInfo, TablePage, TableQuery};

use super::run_blocking;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const FILTER_PREFIX: &str = "filter_";

/// GET /tables
pub async fn list_tables(State(state): State<AppState>) -> ApiResult<Json<Vec<TableInfo>>> {
    let tables = run_blocking(&state.service, |service| service.list_tables()).await??;
    Ok(Json(tables))
}

/// GET /tables/:name?limit=&offset=&filter_<column>=
pub async fn table_data(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<TablePage>> {
    let query = table_query(&params)?;
    let page = run_blocking(&state.service, move |service| service.table_data(&name, &query))
        .await??;
    Ok(Json(page))
}

fn table_query(params: &HashMap<String, String>) -> ApiResult<TableQuery> {
    let mut filters: Vec<(String, String)> = params
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(FILTER_PREFIX)
                .map(|column| (column.to_string(), value.clone()))
        })
        .collect();
    filters.sort();

    Ok(TableQuery {
        limit: parse_number(params, "limit")?,
        offset: parse_number(params, "offset")?,
        filters,
    })
}

fn parse_number(params: &HashMap<String, String>, key: &str) -> ApiResult<Option<u64>> {
    params
        .get(key)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid {}: {}", key, value)))
        })
        .transpose()
}

pub fn table_routes() -> Router<AppState> {
    Router::new()
        .route("/tables", get(list_tables))
        .route("/tables/:name", get(table_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_table_query_collects_filters() {
        let query = table_query(&params(&[
            ("limit", "20"),
            ("filter_name", "ali"),
            ("filter_dept", "ops"),
        ]))
        .unwrap();
        assert_eq!(query.limit, Some(20));
        assert_eq!(query.offset, None);
        assert_eq!(
            query.filters,
            vec![
                ("dept".to_string(), "ops".to_string()),
                ("name".to_string(), "ali".to_string()),
            ]
        );
    }

    #[test]
    fn test_negative_offset_rejected() {
        let err = table_query(&params(&[("offset", "-1")])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
