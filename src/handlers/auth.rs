//! Authentication handlers. OAuth sign-in happens upstream; this surface
//! only mints guest tokens and echoes the verified identity.

use axum::extract::{Extension, Json, State};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::middleware::AuthContext;
use crate::utils::error::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct GuestTokenResponse {
    pub token: String,
    pub owner_id: String,
}

/// POST /api/auth/guest
///
/// Issue a guest identity with a fresh owner id. Guests are subject to the
/// free-tier request quota.
#[utoipa::path(
    post,
    path = "/api/auth/guest",
    responses(
        (status = 200, description = "Guest token issued", body = GuestTokenResponse),
    ),
    tag = "Authentication"
)]
pub async fn guest_token(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<GuestTokenResponse>> {
    let (token, owner_id) = state.jwt_util.issue_guest_token()?;
    tracing::info!("Issued guest token for owner {}", owner_id);
    Ok(Json(GuestTokenResponse { token, owner_id }))
}

/// GET /api/auth/me
#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current identity"),
        (status = 401, description = "Missing or invalid token"),
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn me(Extension(ctx): Extension<AuthContext>) -> Json<AuthContext> {
    Json(ctx)
}
