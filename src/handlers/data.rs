//! Data handler: execute a stored query through the pagination/sort
//! rewriter and return one result page.

use axum::{
    Json,
    extract::{Extension, Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::middleware::AuthContext;
use crate::models::Column;
use crate::services::dialect::Dialect;
use crate::services::sqlcheck::{self, SortOrder, paginate::TOTAL_ROWS_ALIAS};
use crate::utils::error::{ApiError, ApiResult};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct DataQueryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<SortOrder>,
    /// Whether to compute the un-paginated row count (default true)
    pub include_total: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DataResponse {
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<i64>,
}

/// GET /api/data/{query_id}
///
/// Runs the stored SQL wrapped in the dialect-appropriate pagination
/// envelope. `sort_by` must name one of the query's declared columns.
#[utoipa::path(
    get,
    path = "/api/data/{query_id}",
    params(
        ("query_id" = String, Path, description = "Query ID"),
        ("limit" = Option<i64>, Query, description = "Page size (default 100, max 1000)"),
        ("offset" = Option<i64>, Query, description = "Page offset (default 0)"),
        ("sort_by" = Option<String>, Query, description = "Declared column to sort by"),
        ("sort_order" = Option<String>, Query, description = "asc or desc"),
        ("include_total" = Option<bool>, Query, description = "Carry total row count"),
    ),
    responses(
        (status = 200, description = "One page of results", body = DataResponse),
        (status = 400, description = "Invalid pagination or sort parameters"),
        (status = 404, description = "Query not found"),
        (status = 504, description = "Warehouse timeout"),
    ),
    security(("bearer_auth" = [])),
    tag = "Data"
)]
pub async fn get_data(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(query_id): Path<String>,
    Query(params): Query<DataQueryParams>,
) -> ApiResult<Json<DataResponse>> {
    let record = state
        .repository
        .get_query(&query_id)
        .await?
        .ok_or_else(|| ApiError::QueryNotFound { query_id: query_id.clone() })?;

    let session = state
        .repository
        .get_session(&record.session_id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound { session_id: record.session_id.clone() })?;
    if session.owner_id != ctx.owner_id {
        return Err(ApiError::forbidden("Query belongs to another owner"));
    }

    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!("limit must be between 1 and {}", MAX_LIMIT)));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must not be negative"));
    }
    let include_total = params.include_total.unwrap_or(true);

    let columns: Vec<Column> = serde_json::from_str(&record.columns_json)
        .map_err(|e| ApiError::internal_error(format!("stored columns corrupt: {}", e)))?;
    let dialect = Dialect::parse(&record.dialect)
        .unwrap_or_else(|| {
            tracing::warn!("Query {} has unknown dialect '{}'", record.id, record.dialect);
            crate::services::dialect::detect(
                &record.dialect,
                Dialect::parse(&state.config.agent.default_dialect).unwrap_or(Dialect::Trino),
            )
        });

    let page = sqlcheck::build_page_query(
        &record.sql_text,
        params.sort_by.as_deref(),
        params.sort_order.unwrap_or_default(),
        include_total,
        dialect,
        &columns,
    )?;

    let warehouse = state.warehouses.get(&state.config.agent.default_profile)?;
    let rowset = warehouse
        .query_rows(&page.sql, &[("limit", limit), ("offset", offset)])
        .await?;

    let mut total_rows: Option<i64> = None;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = rowset
        .rows
        .into_iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (column, value) in rowset.columns.iter().zip(row) {
                if column.eq_ignore_ascii_case(TOTAL_ROWS_ALIAS) {
                    if total_rows.is_none() {
                        total_rows = value
                            .as_i64()
                            .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
                    }
                    continue;
                }
                object.insert(column.clone(), value);
            }
            object
        })
        .collect();

    Ok(Json(DataResponse {
        rows,
        total_rows: if include_total { total_rows.or(Some(0)) } else { None },
    }))
}
