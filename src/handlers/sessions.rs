//! Session handlers: create sessions, enqueue requests, stream updates.

use axum::{
    Json,
    extract::{Extension, Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use validator::Validate;

use crate::AppState;
use crate::middleware::AuthContext;
use crate::models::{
    CreateRequestBody, CreateRequestResponse, CreateSessionRequest, CreateSessionResponse, Session,
};
use crate::services::events::SessionEvent;
use crate::utils::error::{ApiError, ApiResult};

/// Load a session and enforce ownership
async fn owned_session(
    state: &AppState,
    session_id: &str,
    ctx: &AuthContext,
) -> ApiResult<Session> {
    let session = state
        .repository
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound { session_id: session_id.to_string() })?;

    if session.owner_id != ctx.owner_id {
        return Err(ApiError::forbidden("Session belongs to another owner"));
    }
    Ok(session)
}

/// POST /api/sessions
#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created", body = CreateSessionResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let session = state.repository.create_session(&ctx.owner_id, &body).await?;
    tracing::info!("Created session {} for owner {}", session.id, ctx.owner_id);
    Ok(Json(CreateSessionResponse { id: session.id }))
}

/// GET /api/sessions/{id}
#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session", body = Session),
        (status = 404, description = "Session not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = owned_session(&state, &session_id, &ctx).await?;
    Ok(Json(session))
}

/// POST /api/sessions/{id}/requests
///
/// Enqueue a request. Returns immediately; workers pick the request up in
/// ordinal order and progress streams over the session's SSE channel.
#[utoipa::path(
    post,
    path = "/api/sessions/{id}/requests",
    params(("id" = String, Path, description = "Session ID")),
    request_body = CreateRequestBody,
    responses(
        (status = 200, description = "Request enqueued", body = CreateRequestResponse),
        (status = 400, description = "Invalid request body"),
        (status = 403, description = "Quota exceeded or foreign session"),
        (status = 404, description = "Session not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<String>,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<Json<CreateRequestResponse>> {
    body.validate()
        .map_err(|e| ApiError::validation(format!("Invalid request: {}", e)))?;

    let session = owned_session(&state, &session_id, &ctx).await?;

    let quota = state.config.quota.guest_daily_requests;
    if ctx.guest && quota > 0 {
        let used = state.repository.count_requests_today(&ctx.owner_id).await?;
        if used >= quota {
            return Err(ApiError::QuotaExceeded(format!(
                "guest limit of {} requests per day reached",
                quota
            )));
        }
    }

    let request = state
        .repository
        .create_request(&session.id, body.text.trim())
        .await?;
    state
        .events
        .publish(&session.id, SessionEvent::request_update(&request));

    tracing::info!(
        "Enqueued request {} (session {}, seq {})",
        request.id,
        session.id,
        request.sequence_number
    );

    let status = request.status_enum();
    Ok(Json(CreateRequestResponse {
        id: request.id,
        session_id: session.id,
        sequence_number: request.sequence_number,
        status,
    }))
}

/// GET /api/sessions/{id}/stream
///
/// Server-sent events: a snapshot of all current request states first, then
/// live `request_update` and `agent_status` events. Clients that reconnect
/// replay the snapshot, so missed notifications are recoverable.
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/stream",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "SSE stream of session events"),
        (status = 404, description = "Session not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Sessions"
)]
pub async fn stream_session(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session = owned_session(&state, &session_id, &ctx).await?;

    // Subscribe before the snapshot so no update can fall in between
    let receiver = state.events.subscribe(&session.id);

    let snapshot: Vec<SessionEvent> = state
        .repository
        .session_requests(&session.id)
        .await?
        .iter()
        .map(SessionEvent::request_update)
        .collect();

    let initial = stream::iter(snapshot.into_iter().map(|event| Ok(to_sse_event(&event))));
    let live = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(Ok(to_sse_event(&event))),
            // Lagged subscribers miss events; the next snapshot recovers them
            Err(e) => {
                tracing::warn!("SSE subscriber lagged: {}", e);
                None
            },
        }
    });

    Ok(Sse::new(initial.chain(live)).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &SessionEvent) -> Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_name()).data(payload)
}
