//! Agentic query flow: assemble prompt, call the model for structured
//! metadata, validate metadata against the SQL, validate the SQL against the
//! warehouse, and feed diagnostics back until the query validates or the
//! attempt budget is exhausted.
//!
//! The loop is a finite state machine; transitions are data
//! ([`FlowState::successors`]) and the classifiable failures are values
//! ([`StepFailure`]), not exceptions.

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::models::{Request, RequestError, RequestStatus};
use crate::services::agent::llm::{ChatMessage, LlmClient, LlmError, generate_metadata};
use crate::services::agent::repository::AgentRepository;
use crate::services::events::{AgentPhase, EventHub, SessionEvent};
use crate::services::prompt::PromptAssembler;
use crate::services::provider::MetadataProvider;
use crate::services::sqlcheck::{self, MetadataError, SqlValidation};
use crate::services::warehouse::WarehousePool;
use crate::utils::error::{ApiError, ApiResult};

/// States of the per-request machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Start,
    Assembling,
    CallingLlm,
    ValidatingMetadata,
    ValidatingSql,
    Retry,
    Persisting,
    Done,
    Exhausted,
    Cancelled,
}

impl FlowState {
    /// Legal successor states. Cancellation is reachable from every
    /// non-terminal state.
    pub fn successors(&self) -> &'static [FlowState] {
        use FlowState::*;
        match self {
            Start => &[Assembling, Cancelled],
            Assembling => &[CallingLlm, Cancelled],
            CallingLlm => &[ValidatingMetadata, Retry, Cancelled],
            ValidatingMetadata => &[ValidatingSql, Retry, Cancelled],
            ValidatingSql => &[Persisting, Retry, Cancelled],
            Retry => &[CallingLlm, Exhausted, Cancelled],
            Persisting => &[Done, Cancelled],
            Done | Exhausted | Cancelled => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

/// Classifiable step failures fed back to the model as conversation feedback
#[derive(Debug)]
pub enum StepFailure {
    SchemaViolation(String),
    Metadata(MetadataError),
    Sql(SqlValidation),
}

impl StepFailure {
    pub fn feedback(&self) -> String {
        match self {
            Self::SchemaViolation(detail) => format!(
                "Your reply was not a valid metadata object: {}. Reply with a single \
                 JSON object carrying summary, description, sql and columns.",
                detail
            ),
            Self::Metadata(err) => err.feedback_message(),
            Self::Sql(validation) => validation.feedback_message(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaViolation(_) => "llm_output",
            Self::Metadata(_) => "metadata_validation",
            Self::Sql(_) => "sql_validation",
        }
    }

    pub fn to_request_error(&self) -> RequestError {
        RequestError::new(self.kind(), "The model could not produce a valid query.")
            .with_detail(self.feedback())
    }
}

/// Outcome of one request run
#[derive(Debug)]
pub enum FlowOutcome {
    Done { query_id: String },
    Exhausted { last_failure: StepFailure },
    Cancelled,
    /// Redelivery of an already settled request; treated as a no-op
    AlreadySettled,
}

pub struct AgentFlow {
    repository: Arc<AgentRepository>,
    provider: Arc<MetadataProvider>,
    assembler: Arc<PromptAssembler>,
    warehouses: Arc<WarehousePool>,
    events: Arc<EventHub>,
    llm: Arc<dyn LlmClient>,
    config: AgentConfig,
}

impl AgentFlow {
    pub fn new(
        repository: Arc<AgentRepository>,
        provider: Arc<MetadataProvider>,
        assembler: Arc<PromptAssembler>,
        warehouses: Arc<WarehousePool>,
        events: Arc<EventHub>,
        llm: Arc<dyn LlmClient>,
        config: AgentConfig,
    ) -> Self {
        Self { repository, provider, assembler, warehouses, events, llm, config }
    }

    /// Drive one claimed request to a terminal state, persisting the outcome.
    /// Never returns an error: failures land in the request row.
    pub async fn process(&self, request: Request) {
        let request_id = request.id.clone();
        let session_id = request.session_id.clone();

        match self.run(&request).await {
            Ok(FlowOutcome::Done { query_id }) => {
                tracing::info!("Request {} done (query {})", request_id, query_id);
            },
            Ok(FlowOutcome::Cancelled) => {
                tracing::info!("Request {} cancelled mid-flight", request_id);
                self.publish_current(&request_id, &session_id).await;
            },
            Ok(FlowOutcome::AlreadySettled) => {
                tracing::debug!("Request {} redelivered after settling; ignoring", request_id);
            },
            Ok(FlowOutcome::Exhausted { last_failure }) => {
                tracing::warn!(
                    "Request {} exhausted its attempt budget: {}",
                    request_id,
                    last_failure.kind()
                );
                let error = last_failure.to_request_error();
                if let Err(e) = self.repository.mark_request_error(&request_id, &error).await {
                    tracing::error!("Failed to persist exhaustion for {}: {}", request_id, e);
                }
                self.publish_current(&request_id, &session_id).await;
            },
            Err(api_error) => {
                tracing::error!("Request {} failed: {}", request_id, api_error);
                let error = request_error_from_api(&api_error);
                if let Err(e) = self.repository.mark_request_error(&request_id, &error).await {
                    tracing::error!("Failed to persist error for {}: {}", request_id, e);
                }
                self.publish_current(&request_id, &session_id).await;
            },
        }
    }

    async fn run(&self, request: &Request) -> ApiResult<FlowOutcome> {
        let mut state = FlowState::Start;

        // At-least-once delivery: a settled request must not be re-run
        match self.repository.request_status(&request.id).await? {
            Some(status) if status.is_terminal() => return Ok(FlowOutcome::AlreadySettled),
            Some(_) => {},
            None => return Ok(FlowOutcome::AlreadySettled),
        }

        self.publish_current(&request.id, &request.session_id).await;

        // -------- ASSEMBLING: context build --------
        advance(&mut state, FlowState::Assembling);
        self.publish_phase(request, AgentPhase::IntentAnalyzing);

        let profile = self.config.default_profile.clone();
        let dialect = self.warehouses.dialect_for(&profile)?;

        self.publish_phase(request, AgentPhase::SchemaLoading);
        let bundle = self
            .provider
            .get_prompt_bundle(&profile, Some(&request.user_text))
            .await?;
        let history = self
            .repository
            .session_history(&request.session_id, 10)
            .await?;

        let variables = build_variables(request, &bundle, &history, dialect.as_str());
        let prompt = self.assembler.assemble("interactive_query", &variables)?;
        tracing::debug!(
            "Assembled prompt for {} from {} fragments",
            request.id,
            prompt.lineage.len()
        );

        let mut messages =
            vec![ChatMessage::system(prompt.text), ChatMessage::user(request.user_text.clone())];

        // -------- repair loop --------
        let mut last_failure: Option<StepFailure> = None;

        for attempt in 1..=self.config.max_attempts {
            if self.cancelled(&request.id).await? {
                advance(&mut state, FlowState::Cancelled);
                return Ok(FlowOutcome::Cancelled);
            }

            advance(&mut state, FlowState::CallingLlm);
            self.publish_phase(request, AgentPhase::LlmThinking);

            let meta = match generate_metadata(self.llm.as_ref(), &messages, 2).await {
                Ok(meta) => meta,
                Err(LlmError::SchemaViolation(detail)) => {
                    let failure = StepFailure::SchemaViolation(detail);
                    messages.push(ChatMessage::system(failure.feedback()));
                    last_failure = Some(failure);
                    advance(&mut state, FlowState::Retry);
                    continue;
                },
                // Provider exhausted its own retries; the repair loop cannot fix it
                Err(e) => return Err(ApiError::internal_error(format!("LLM failure: {}", e))),
            };

            advance(&mut state, FlowState::ValidatingMetadata);
            self.publish_phase(request, AgentPhase::MetadataValidating);

            if let Err(metadata_error) = sqlcheck::ensure_valid(&meta, dialect) {
                let failure = StepFailure::Metadata(metadata_error);
                messages.push(ChatMessage::assistant(meta.sql.clone()));
                messages.push(ChatMessage::system(failure.feedback()));
                last_failure = Some(failure);
                advance(&mut state, FlowState::Retry);
                continue;
            }

            if self.cancelled(&request.id).await? {
                advance(&mut state, FlowState::Cancelled);
                return Ok(FlowOutcome::Cancelled);
            }

            advance(&mut state, FlowState::ValidatingSql);
            self.publish_phase(request, AgentPhase::SqlValidating);

            let validation = self.provider.explain_analyze(&meta.sql, &profile).await?;
            if !validation.valid {
                let failure = StepFailure::Sql(validation);
                messages.push(ChatMessage::assistant(meta.sql.clone()));
                messages.push(ChatMessage::system(failure.feedback()));
                last_failure = Some(failure);
                advance(&mut state, FlowState::Retry);
                continue;
            }

            // -------- PERSISTING --------
            if self.cancelled(&request.id).await? {
                advance(&mut state, FlowState::Cancelled);
                return Ok(FlowOutcome::Cancelled);
            }

            advance(&mut state, FlowState::Persisting);
            self.publish_phase(request, AgentPhase::ArtifactSaving);

            let record = self
                .repository
                .persist_query(&request.session_id, &request.id, &meta, dialect.as_str())
                .await?;
            self.repository.complete_request(&request.id, &record.id).await?;
            self.publish_current(&request.id, &request.session_id).await;

            let (previous_error, previous_sql) = match &last_failure {
                Some(StepFailure::Sql(validation)) => (
                    validation.error.as_ref().map(|e| e.message.clone()),
                    previous_attempt_sql(&messages),
                ),
                _ => (None, None),
            };
            if let Err(e) = self
                .provider
                .log_successful_query(
                    &record.id,
                    &meta.sql,
                    &meta.description,
                    &profile,
                    previous_error.as_deref(),
                    previous_sql.as_deref(),
                )
                .await
            {
                tracing::warn!("Learning hook failed for {}: {}", record.id, e);
            }

            advance(&mut state, FlowState::Done);
            tracing::debug!("Request {} validated on attempt {}", request.id, attempt);
            return Ok(FlowOutcome::Done { query_id: record.id });
        }

        // The loop only falls through from a Retry state
        advance(&mut state, FlowState::Exhausted);
        let last_failure = last_failure.unwrap_or(StepFailure::SchemaViolation(
            "no attempt produced output".to_string(),
        ));
        Ok(FlowOutcome::Exhausted { last_failure })
    }

    async fn cancelled(&self, request_id: &str) -> ApiResult<bool> {
        Ok(self.repository.request_status(request_id).await? == Some(RequestStatus::Cancelled))
    }

    fn publish_phase(&self, request: &Request, phase: AgentPhase) {
        self.events
            .publish(&request.session_id, SessionEvent::agent_status(request, phase));
    }

    /// Publish the request row as currently stored
    async fn publish_current(&self, request_id: &str, session_id: &str) {
        match self.repository.get_request(request_id).await {
            Ok(Some(request)) => {
                self.events
                    .publish(session_id, SessionEvent::request_update(&request));
            },
            Ok(None) => {},
            Err(e) => tracing::warn!("Failed to load request {} for event: {}", request_id, e),
        }
    }
}

/// The last SQL the model proposed, mined from the conversation
fn previous_attempt_sql(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content.clone())
}

fn build_variables(
    request: &Request,
    bundle: &crate::services::provider::PromptBundle,
    history: &[(String, Option<crate::models::QueryRecord>)],
    dialect: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let history_json: Vec<serde_json::Value> = history
        .iter()
        .map(|(user_text, query)| {
            serde_json::json!({
                "user": user_text,
                "summary": query.as_ref().map(|q| q.summary.clone()),
                "sql": query.as_ref().map(|q| q.sql_text.clone()),
            })
        })
        .collect();

    let examples_json: Vec<serde_json::Value> = bundle
        .examples
        .iter()
        .map(|example| {
            serde_json::json!({
                "description": example.description,
                "sql": example.sql,
            })
        })
        .collect();

    let mut variables = serde_json::Map::new();
    variables.insert("user_request".into(), request.user_text.clone().into());
    variables.insert("schema_block".into(), bundle.schema_block.clone().into());
    variables.insert("instructions".into(), bundle.instructions.clone().into());
    variables.insert("examples".into(), serde_json::Value::Array(examples_json));
    variables.insert("history".into(), serde_json::Value::Array(history_json));
    variables.insert("dialect".into(), dialect.into());
    variables.insert(
        "now".into(),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string().into(),
    );
    variables
}

fn request_error_from_api(error: &ApiError) -> RequestError {
    let kind = match error {
        ApiError::WarehouseTimeout => "warehouse_timeout",
        ApiError::WarehouseConnectionFailed(_) | ApiError::WarehouseError(_) => "warehouse",
        ApiError::Assembly(_) => "assembly",
        _ => "internal",
    };
    RequestError::new(kind, "The request could not be completed.").with_detail(error.to_string())
}

/// Move the machine, enforcing the transition table
fn advance(state: &mut FlowState, next: FlowState) {
    debug_assert!(
        state.successors().contains(&next),
        "illegal flow transition {:?} -> {:?}",
        state,
        next
    );
    tracing::trace!("flow {:?} -> {:?}", state, next);
    *state = next;
}
