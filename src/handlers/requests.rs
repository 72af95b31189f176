//! Request handlers: state inspection and cancellation.

use axum::{
    Json,
    extract::{Extension, Path, State},
};
use std::sync::Arc;

use crate::AppState;
use crate::middleware::AuthContext;
use crate::models::{Request, RequestView};
use crate::services::events::SessionEvent;
use crate::utils::error::{ApiError, ApiResult};

async fn owned_request(
    state: &AppState,
    request_id: &str,
    ctx: &AuthContext,
) -> ApiResult<Request> {
    let request = state
        .repository
        .get_request(request_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Request {} not found", request_id)))?;

    let session = state
        .repository
        .get_session(&request.session_id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound { session_id: request.session_id.clone() })?;

    if session.owner_id != ctx.owner_id {
        return Err(ApiError::forbidden("Request belongs to another owner"));
    }
    Ok(request)
}

/// GET /api/requests/{id}
///
/// Current request state, including the linked query metadata once done.
#[utoipa::path(
    get,
    path = "/api/requests/{id}",
    params(("id" = String, Path, description = "Request ID")),
    responses(
        (status = 200, description = "Request state", body = RequestView),
        (status = 404, description = "Request not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Requests"
)]
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let request = owned_request(&state, &request_id, &ctx).await?;

    let query = match &request.query_id {
        Some(query_id) => state
            .repository
            .get_query(query_id)
            .await?
            .map(|record| record.into_metadata())
            .transpose()
            .map_err(|e| ApiError::internal_error(format!("stored columns corrupt: {}", e)))?,
        None => None,
    };

    Ok(Json(RequestView::from_parts(request, query)))
}

/// POST /api/requests/{id}/cancel
///
/// Cancel a pending or in-flight request. Workers honor the cancellation at
/// their next await boundary; partial artifacts are discarded.
#[utoipa::path(
    post,
    path = "/api/requests/{id}/cancel",
    params(("id" = String, Path, description = "Request ID")),
    responses(
        (status = 200, description = "Request state after cancellation", body = RequestView),
        (status = 404, description = "Request not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Requests"
)]
pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let request = owned_request(&state, &request_id, &ctx).await?;

    match state.repository.cancel_request(&request.id).await? {
        Some(cancelled) => {
            state
                .events
                .publish(&cancelled.session_id, SessionEvent::request_update(&cancelled));
            tracing::info!("Cancelled request {}", cancelled.id);
            Ok(Json(RequestView::from_parts(cancelled, None)))
        },
        // Already terminal; report current state unchanged
        None => Ok(Json(RequestView::from_parts(request, None))),
    }
}
