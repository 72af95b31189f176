use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use super::query::QueryMetadata;

/// Request lifecycle status. Transitions are monotonic except for re-queue
/// after error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Done,
    Error,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            "cancelled" => Self::Cancelled,
            _ => Self::Error,
        }
    }

    /// Terminal states never transition again (except error -> pending re-queue)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// One user utterance and its lifecycle, as stored
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Request {
    pub id: String,
    pub session_id: String,
    pub sequence_number: i64,
    pub user_text: String,
    pub status: String,
    pub query_id: Option<String>,
    pub error_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn status_enum(&self) -> RequestStatus {
        RequestStatus::parse_status(&self.status)
    }

    pub fn error_payload(&self) -> Option<RequestError> {
        self.error_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Human-readable error payload attached to an errored request.
/// `kind` is stable for programmatic consumers; `message` is for display.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RequestError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RequestError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRequestBody {
    #[validate(length(min = 1, max = 4000))]
    pub text: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateRequestResponse {
    pub id: String,
    pub session_id: String,
    pub sequence_number: i64,
    pub status: RequestStatus,
}

/// Full request state returned by GET /api/requests/{id}
#[derive(Debug, Serialize, ToSchema)]
pub struct RequestView {
    pub id: String,
    pub session_id: String,
    pub sequence_number: i64,
    pub user_text: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestView {
    pub fn from_parts(request: Request, query: Option<QueryMetadata>) -> Self {
        let status = request.status_enum();
        let error = request.error_payload();
        Self {
            id: request.id,
            session_id: request.session_id,
            sequence_number: request.sequence_number,
            user_text: request.user_text,
            status,
            query,
            error,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::InProgress,
            RequestStatus::Done,
            RequestStatus::Error,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::parse_status(status.as_str()), status);
        }
    }

    #[test]
    fn test_unknown_status_is_error() {
        assert_eq!(RequestStatus::parse_status("weird"), RequestStatus::Error);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::InProgress.is_terminal());
        assert!(RequestStatus::Done.is_terminal());
        assert!(RequestStatus::Error.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_payload_round_trip() {
        let err = RequestError::new("sql_validation", "EXPLAIN failed").with_detail("line 3");
        let json = serde_json::to_string(&err).unwrap();
        let back: RequestError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "sql_validation");
        assert_eq!(back.detail.as_deref(), Some("line 3"));
    }
}
