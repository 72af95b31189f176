//! Agent repository - operational-store persistence for sessions, requests,
//! and query metadata, including the queue semantics workers rely on.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{
    CreateSessionRequest, QueryMetadata, QueryRecord, Request, RequestError, RequestStatus, Session,
};
use crate::utils::error::{ApiError, ApiResult};

pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        owner_id: &str,
        req: &CreateSessionRequest,
    ) -> ApiResult<Session> {
        let id = Uuid::new_v4().to_string();

        if let Some(parent_id) = &req.parent_id
            && self.get_session(parent_id).await?.is_none()
        {
            return Err(ApiError::SessionNotFound { session_id: parent_id.clone() });
        }

        sqlx::query(
            r#"INSERT INTO sessions (id, owner_id, parent_id, summary, tags)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(owner_id)
        .bind(&req.parent_id)
        .bind(&req.summary)
        .bind(&req.tags)
        .execute(&self.pool)
        .await?;

        self.get_session(&id)
            .await?
            .ok_or_else(|| ApiError::internal_error("session vanished after insert"))
    }

    pub async fn get_session(&self, id: &str) -> ApiResult<Option<Session>> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::from)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Enqueue a request: bump the session's ordinal counter and insert the
    /// row as `pending`, atomically.
    pub async fn create_request(&self, session_id: &str, user_text: &str) -> ApiResult<Request> {
        let mut tx = self.pool.begin().await?;

        let sequence_number: Option<i64> = sqlx::query_scalar(
            r#"UPDATE sessions
               SET sequence_counter = sequence_counter + 1,
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = ?
               RETURNING sequence_counter"#,
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(sequence_number) = sequence_number else {
            return Err(ApiError::SessionNotFound { session_id: session_id.to_string() });
        };

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO requests (id, session_id, sequence_number, user_text, status)
               VALUES (?, ?, ?, ?, 'pending')"#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(sequence_number)
        .bind(user_text)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_request(&id)
            .await?
            .ok_or_else(|| ApiError::internal_error("request vanished after insert"))
    }

    pub async fn get_request(&self, id: &str) -> ApiResult<Option<Request>> {
        sqlx::query_as::<_, Request>("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::from)
    }

    /// All requests of a session in ordinal order (stream snapshot, history)
    pub async fn session_requests(&self, session_id: &str) -> ApiResult<Vec<Request>> {
        sqlx::query_as::<_, Request>(
            "SELECT * FROM requests WHERE session_id = ? ORDER BY sequence_number ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::from)
    }

    pub async fn request_status(&self, id: &str) -> ApiResult<Option<RequestStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref().map(RequestStatus::parse_status))
    }

    /// Claim the next runnable request: per session, only the lowest pending
    /// ordinal whose predecessors are all settled is eligible. The claim is a
    /// compare-and-set, so concurrent workers never take the same request and
    /// redelivery of a settled request is a no-op.
    pub async fn claim_next_request(&self) -> ApiResult<Option<Request>> {
        loop {
            let candidate: Option<Request> = sqlx::query_as(
                r#"SELECT r.* FROM requests r
                   WHERE r.status = 'pending'
                     AND NOT EXISTS (
                        SELECT 1 FROM requests prior
                        WHERE prior.session_id = r.session_id
                          AND prior.sequence_number < r.sequence_number
                          AND prior.status IN ('pending', 'in_progress')
                     )
                   ORDER BY r.created_at ASC, r.id ASC
                   LIMIT 1"#,
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                r#"UPDATE requests
                   SET status = 'in_progress', updated_at = CURRENT_TIMESTAMP
                   WHERE id = ? AND status = 'pending'"#,
            )
            .bind(&candidate.id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return self.get_request(&candidate.id).await;
            }
            // Lost the race; look for another candidate
        }
    }

    pub async fn set_request_status(&self, id: &str, status: RequestStatus) -> ApiResult<()> {
        sqlx::query(
            "UPDATE requests SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a request unless it already reached a terminal state.
    /// Returns the updated row when the cancellation took effect.
    pub async fn cancel_request(&self, id: &str) -> ApiResult<Option<Request>> {
        let updated = sqlx::query(
            r#"UPDATE requests
               SET status = 'cancelled', updated_at = CURRENT_TIMESTAMP
               WHERE id = ? AND status IN ('pending', 'in_progress')"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_request(id).await
    }

    pub async fn mark_request_error(&self, id: &str, error: &RequestError) -> ApiResult<()> {
        let error_json = serde_json::to_string(error)
            .map_err(|e| ApiError::internal_error(format!("error payload: {}", e)))?;
        sqlx::query(
            r#"UPDATE requests
               SET status = 'error', error_json = ?, updated_at = CURRENT_TIMESTAMP
               WHERE id = ?"#,
        )
        .bind(error_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-queue an errored request (the one allowed non-monotonic transition)
    pub async fn requeue_errored(&self, id: &str) -> ApiResult<bool> {
        let updated = sqlx::query(
            r#"UPDATE requests
               SET status = 'pending', error_json = NULL, updated_at = CURRENT_TIMESTAMP
               WHERE id = ? AND status = 'error'"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    pub async fn complete_request(&self, id: &str, query_id: &str) -> ApiResult<()> {
        sqlx::query(
            r#"UPDATE requests
               SET status = 'done', query_id = ?, error_json = NULL,
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = ?"#,
        )
        .bind(query_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Crash recovery: fail requests stuck `in_progress` beyond `max_age`.
    /// Returns the affected rows so the caller can notify subscribers.
    pub async fn fail_stale_requests(&self, max_age_secs: i64) -> ApiResult<Vec<Request>> {
        // Compare in the CURRENT_TIMESTAMP text format the rows are stored in
        let cutoff = (Utc::now() - ChronoDuration::seconds(max_age_secs))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let stale: Vec<Request> = sqlx::query_as(
            "SELECT * FROM requests WHERE status = 'in_progress' AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let error = RequestError::new(
            "worker_timeout",
            "The request was abandoned by its worker and timed out.",
        );
        let mut failed = Vec::with_capacity(stale.len());
        for request in stale {
            self.mark_request_error(&request.id, &error).await?;
            if let Some(updated) = self.get_request(&request.id).await? {
                failed.push(updated);
            }
        }
        Ok(failed)
    }

    /// Requests created today by one owner, for the free-tier quota
    pub async fn count_requests_today(&self, owner_id: &str) -> ApiResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM requests r
               JOIN sessions s ON s.id = r.session_id
               WHERE s.owner_id = ? AND r.created_at >= date('now')"#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Prior turns of a session in order: (user_text, produced summary+sql)
    pub async fn session_history(
        &self,
        session_id: &str,
        limit: i64,
    ) -> ApiResult<Vec<(String, Option<QueryRecord>)>> {
        let requests: Vec<Request> = sqlx::query_as(
            r#"SELECT * FROM requests
               WHERE session_id = ? AND status = 'done'
               ORDER BY sequence_number DESC
               LIMIT ?"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(requests.len());
        for request in requests.into_iter().rev() {
            let query = match &request.query_id {
                Some(query_id) => self.get_query(query_id).await?,
                None => None,
            };
            history.push((request.user_text, query));
        }
        Ok(history)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Persist a query produced for `request`, linking refinement lineage to
    /// the previous query in the same session.
    pub async fn persist_query(
        &self,
        session_id: &str,
        request_id: &str,
        meta: &QueryMetadata,
        dialect: &str,
    ) -> ApiResult<QueryRecord> {
        let id = Uuid::new_v4().to_string();
        let parent_id = self
            .last_query_in_session(session_id)
            .await?
            .map(|record| record.id);
        let columns_json = serde_json::to_string(&meta.columns)
            .map_err(|e| ApiError::internal_error(format!("columns payload: {}", e)))?;

        sqlx::query(
            r#"INSERT INTO queries
               (id, session_id, request_id, parent_id, summary, description,
                sql_text, result_narrative, columns_json, dialect)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(request_id)
        .bind(&parent_id)
        .bind(&meta.summary)
        .bind(&meta.description)
        .bind(&meta.sql)
        .bind(&meta.result_narrative)
        .bind(columns_json)
        .bind(dialect)
        .execute(&self.pool)
        .await?;

        self.get_query(&id)
            .await?
            .ok_or_else(|| ApiError::internal_error("query vanished after insert"))
    }

    pub async fn get_query(&self, id: &str) -> ApiResult<Option<QueryRecord>> {
        sqlx::query_as::<_, QueryRecord>("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::from)
    }

    pub async fn last_query_in_session(&self, session_id: &str) -> ApiResult<Option<QueryRecord>> {
        sqlx::query_as::<_, QueryRecord>(
            r#"SELECT * FROM queries WHERE session_id = ?
               ORDER BY rowid DESC LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::from)
    }

    /// Walk refinement lineage upwards, bounded
    pub async fn query_ancestors(&self, id: &str, max_depth: usize) -> ApiResult<Vec<QueryRecord>> {
        let mut ancestors = Vec::new();
        let mut cursor = self.get_query(id).await?.and_then(|q| q.parent_id.clone());
        while let Some(parent_id) = cursor {
            if ancestors.len() >= max_depth {
                break;
            }
            let Some(parent) = self.get_query(&parent_id).await? else {
                break;
            };
            cursor = parent.parent_id.clone();
            ancestors.push(parent);
        }
        Ok(ancestors)
    }

    // ------------------------------------------------------------------
    // Learned examples
    // ------------------------------------------------------------------

    pub async fn insert_learned_example(
        &self,
        profile: &str,
        description: &str,
        sql: &str,
        previous_error: Option<&str>,
        previous_sql: Option<&str>,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO learned_examples
               (profile, description, sql_text, previous_error, previous_sql)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(profile)
        .bind(description)
        .bind(sql)
        .bind(previous_error)
        .bind(previous_sql)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn learned_examples(
        &self,
        profile: &str,
    ) -> ApiResult<Vec<crate::services::vector::QueryExample>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT description, sql_text FROM learned_examples WHERE profile = ?",
        )
        .bind(profile)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(description, sql)| crate::services::vector::QueryExample {
                description,
                sql,
                tables: vec![],
            })
            .collect())
    }
}
