use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::utils::{ApiError, JwtUtil};

#[derive(Clone)]
pub struct AuthState {
    pub jwt_util: Arc<JwtUtil>,
}

/// Identity attached to every authenticated request. Guests carry a
/// generated owner id; authenticated users carry the identity established by
/// the upstream OAuth layer.
#[derive(Clone, Debug, serde::Serialize)]
pub struct AuthContext {
    pub owner_id: String,
    pub name: String,
    pub guest: bool,
}

/// Bearer-token authentication middleware. Verifies the JWT and writes the
/// [`AuthContext`] into request extensions for handlers.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let uri_full = req.uri().to_string();
    let uri = uri_full.split('?').next().unwrap_or(&uri_full).to_string();
    let method = req.method().to_string();

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing authorization header for {} {}", method, uri);
            ApiError::unauthorized("Missing authorization header")
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::warn!("Invalid authorization header format for {} {}", method, uri);
        ApiError::unauthorized("Invalid authorization header format")
    })?;

    let claims = state.jwt_util.verify_token(token).map_err(|err| {
        tracing::warn!("JWT verification failed for {} {}: {:?}", method, uri, err);
        err
    })?;

    tracing::debug!("Token verified for {} ({}) on {} {}", claims.name, claims.sub, method, uri);

    let context =
        AuthContext { owner_id: claims.sub, name: claims.name, guest: claims.guest };
    req.extensions_mut().insert(context);

    Ok(next.run(req).await)
}
