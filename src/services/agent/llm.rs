//! LLM client for OpenAI-compatible chat completion APIs.
//!
//! The model is asked for structured JSON output (`response_format:
//! json_object`); the local serde parse into [`QueryMetadata`] is the schema
//! enforcement backstop for providers that ignore the hint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::QueryMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// LLM provider errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM output violates the expected schema: {0}")]
    SchemaViolation(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),
}

impl LlmError {
    /// Provider-side failures worth retrying with back-off. Schema violations
    /// are not retried here; the repair loop handles them with feedback.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}

/// The single seam the flow depends on: messages in, raw model text out.
/// Providers are swappable; tests plug in scripted fakes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns (content, input_tokens, output_tokens)
    async fn complete(&self, messages: &[ChatMessage]) -> Result<(String, i32, i32), LlmError>;
}

/// Reqwest-backed client speaking the OpenAI-compatible wire format
pub struct OpenAiCompatClient {
    http_client: Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self { http_client, config }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<(String, i32, i32), LlmError> {
        let chat_request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            // Determinism: same context must yield the same metadata
            temperature: Some(0.0),
            response_format: Some(ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));

        tracing::debug!("Calling LLM API: {} with model {}", url, self.config.model);

        let mut request = self.http_client.post(&url).json(&chat_request);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.config.timeout_secs)
            } else {
                LlmError::ApiError(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| LlmError::ParseError("Empty response from LLM".to_string()))?;

        let input_tokens = chat_response
            .usage
            .as_ref()
            .map(|u| u.prompt_tokens)
            .unwrap_or(0);
        let output_tokens = chat_response
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0);

        Ok((content.clone(), input_tokens, output_tokens))
    }
}

/// Call the model and parse the structured [`QueryMetadata`] payload.
/// Retries retryable provider errors with doubling back-off; schema
/// violations go straight back to the repair loop.
pub async fn generate_metadata(
    client: &dyn LlmClient,
    messages: &[ChatMessage],
    provider_retries: u32,
) -> Result<QueryMetadata, LlmError> {
    let mut attempt = 0;
    let content = loop {
        match client.complete(messages).await {
            Ok((content, input_tokens, output_tokens)) => {
                tracing::debug!(
                    "LLM call succeeded ({} in / {} out tokens)",
                    input_tokens,
                    output_tokens
                );
                break content;
            },
            Err(e) if e.is_retryable() && attempt < provider_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt.min(4)));
                tracing::warn!(
                    "LLM provider error (attempt {}): {}. Backing off {:?}",
                    attempt,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            },
            Err(e) => return Err(e),
        }
    };

    parse_metadata(&content)
}

/// Parse model output into metadata, tolerating markdown code fences
pub fn parse_metadata(content: &str) -> Result<QueryMetadata, LlmError> {
    let trimmed = strip_code_fence(content.trim());
    serde_json::from_str::<QueryMetadata>(trimmed).map_err(|e| {
        LlmError::SchemaViolation(format!("{} in model output: {}", e, truncate(trimmed, 400)))
    })
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        responses: Vec<Result<String, LlmError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
        ) -> Result<(String, i32, i32), LlmError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(index.min(self.responses.len() - 1)) {
                Some(Ok(content)) => Ok((content.clone(), 10, 20)),
                Some(Err(LlmError::ApiError(msg))) => Err(LlmError::ApiError(msg.clone())),
                Some(Err(LlmError::Timeout(s))) => Err(LlmError::Timeout(*s)),
                _ => Err(LlmError::ApiError("script exhausted".into())),
            }
        }
    }

    const VALID_JSON: &str = r#"{
        "summary": "List users",
        "description": "Lists all users.",
        "sql": "SELECT user_id FROM users",
        "columns": [{"column_name": "user_id"}]
    }"#;

    #[test]
    fn test_parse_metadata_plain_json() {
        let meta = parse_metadata(VALID_JSON).unwrap();
        assert_eq!(meta.summary, "List users");
    }

    #[test]
    fn test_parse_metadata_strips_code_fence() {
        let fenced = format!("```json\n{}\n```", VALID_JSON);
        let meta = parse_metadata(&fenced).unwrap();
        assert_eq!(meta.columns.len(), 1);
    }

    #[test]
    fn test_parse_metadata_schema_violation() {
        let err = parse_metadata(r#"{"summary": "x"}"#).unwrap_err();
        assert!(matches!(err, LlmError::SchemaViolation(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout(5).is_retryable());
        assert!(LlmError::RateLimited(60).is_retryable());
        assert!(LlmError::ApiError("503".into()).is_retryable());
        assert!(!LlmError::SchemaViolation("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_generate_metadata_retries_provider_errors() {
        let client = ScriptedClient {
            responses: vec![
                Err(LlmError::ApiError("503".into())),
                Ok(VALID_JSON.to_string()),
            ],
            calls: AtomicUsize::new(0),
        };
        let meta = generate_metadata(&client, &[ChatMessage::user("hi")], 2)
            .await
            .unwrap();
        assert_eq!(meta.summary, "List users");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_metadata_gives_up_after_budget() {
        let client = ScriptedClient {
            responses: vec![Err(LlmError::ApiError("503".into()))],
            calls: AtomicUsize::new(0),
        };
        let err = generate_metadata(&client, &[ChatMessage::user("hi")], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ApiError(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chat_message_roles() {
        assert_eq!(ChatMessage::system("a").role, "system");
        assert_eq!(ChatMessage::user("b").role, "user");
        assert_eq!(ChatMessage::assistant("c").role, "assistant");
    }
}
