use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// A session: an append-only, ordered sequence of requests belonging to one
/// owner (authenticated or guest). `sequence_counter` is the next request
/// ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub parent_id: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<String>,
    pub sequence_counter: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub parent_id: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub id: String,
}
