//! Vector relevance: an embeddings client (OpenAI-compatible wire format)
//! plus in-process cosine indices for query examples and table descriptions.
//!
//! Indices are read-only at request time; rebuilds swap the whole per-profile
//! index. Without a configured embedding provider the lookups degrade to
//! pinned tables and empty example sets.

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding API error: {0}")]
    Api(String),

    #[error("embedding request timed out")]
    Timeout,

    #[error("embedding response malformed: {0}")]
    Parse(String),
}

// ============================================================================
// Embedding client
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    http_client: Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl EmbeddingClient {
    /// Returns None when no embedding endpoint is configured
    pub fn from_config(config: &EmbeddingConfig) -> Option<Self> {
        let api_base = config.api_base.clone()?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Some(Self {
            http_client,
            api_base,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let body = EmbeddingRequest { model: &self.model, input: texts };

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() { EmbedError::Timeout } else { EmbedError::Api(e.to_string()) }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbedError::Api(format!("API error {}: {}", status, error_text)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Parse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbedError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut result = self.embed(std::slice::from_ref(&text.to_string())).await?;
        result
            .pop()
            .ok_or_else(|| EmbedError::Parse("empty embedding response".to_string()))
    }
}

// ============================================================================
// Cosine index
// ============================================================================

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Immutable snapshot of embedded items; rebuilds replace the whole snapshot
struct IndexSnapshot<T> {
    items: Vec<(T, Vec<f32>)>,
}

impl<T: Clone> IndexSnapshot<T> {
    fn top_k(&self, query: &[f32], k: usize) -> Vec<(T, f32)> {
        let mut scored: Vec<(T, f32)> = self
            .items
            .iter()
            .map(|(item, vector)| (item.clone(), cosine_similarity(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

// ============================================================================
// Domain items
// ============================================================================

/// A curated or learned (natural language, SQL) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryExample {
    pub description: String,
    pub sql: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredExample {
    pub example: QueryExample,
    pub score: f32,
}

/// A table description used for relevance filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub qualified_name: String,
    pub description: String,
}

// ============================================================================
// Relevance service
// ============================================================================

/// Per-profile example and table indices with embedding-backed lookups
pub struct RelevanceService {
    embeddings: Option<EmbeddingClient>,
    examples: DashMap<String, Arc<IndexSnapshot<QueryExample>>>,
    tables: DashMap<String, Arc<IndexSnapshot<TableEntry>>>,
}

impl RelevanceService {
    pub fn new(embeddings: Option<EmbeddingClient>) -> Self {
        Self { embeddings, examples: DashMap::new(), tables: DashMap::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.embeddings.is_some()
    }

    /// Rebuild the example index for a profile (offline/startup job)
    pub async fn rebuild_examples(
        &self,
        profile: &str,
        examples: Vec<QueryExample>,
    ) -> Result<usize, EmbedError> {
        let Some(client) = &self.embeddings else {
            return Ok(0);
        };
        let texts: Vec<String> = examples.iter().map(|e| e.description.clone()).collect();
        let vectors = client.embed(&texts).await?;
        let items = examples.into_iter().zip(vectors).collect::<Vec<_>>();
        let count = items.len();
        self.examples
            .insert(profile.to_string(), Arc::new(IndexSnapshot { items }));
        tracing::info!("Rebuilt example index for '{}' with {} entries", profile, count);
        Ok(count)
    }

    /// Rebuild the table-relevance index for a profile
    pub async fn rebuild_tables(
        &self,
        profile: &str,
        tables: Vec<TableEntry>,
    ) -> Result<usize, EmbedError> {
        let Some(client) = &self.embeddings else {
            return Ok(0);
        };
        let texts: Vec<String> = tables
            .iter()
            .map(|t| format!("{}: {}", t.qualified_name, t.description))
            .collect();
        let vectors = client.embed(&texts).await?;
        let items = tables.into_iter().zip(vectors).collect::<Vec<_>>();
        let count = items.len();
        self.tables
            .insert(profile.to_string(), Arc::new(IndexSnapshot { items }));
        tracing::info!("Rebuilt table index for '{}' with {} entries", profile, count);
        Ok(count)
    }

    /// Append one learned example without a full rebuild
    pub async fn add_example(&self, profile: &str, example: QueryExample) {
        let Some(client) = &self.embeddings else {
            return;
        };
        match client.embed_one(&example.description).await {
            Ok(vector) => {
                let mut items = self
                    .examples
                    .get(profile)
                    .map(|snapshot| snapshot.items.clone())
                    .unwrap_or_default();
                items.push((example, vector));
                self.examples
                    .insert(profile.to_string(), Arc::new(IndexSnapshot { items }));
            },
            Err(e) => tracing::warn!("Failed to embed learned example: {}", e),
        }
    }

    /// Nearest (description, SQL) pairs for a request, best first. Degrades
    /// to empty on embedding failure; relevance is advisory.
    pub async fn relevant_examples(
        &self,
        user_request: &str,
        profile: &str,
        top_k: usize,
    ) -> Vec<ScoredExample> {
        let Some(client) = &self.embeddings else {
            return vec![];
        };
        let Some(snapshot) = self.examples.get(profile).map(|s| Arc::clone(s.value())) else {
            return vec![];
        };

        match client.embed_one(user_request).await {
            Ok(query) => snapshot
                .top_k(&query, top_k)
                .into_iter()
                .map(|(example, score)| ScoredExample { example, score })
                .collect(),
            Err(e) => {
                tracing::warn!("Example lookup degraded to empty: {}", e);
                vec![]
            },
        }
    }

    /// Relevant table names for a request. Matches below `threshold` are
    /// dropped; pinned tables are always included; if nothing clears the
    /// threshold the raw top-k is used instead.
    pub async fn relevant_tables(
        &self,
        user_request: &str,
        profile: &str,
        top_k: usize,
        threshold: f32,
        pinned: &[String],
    ) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();

        let snapshot = self.tables.get(profile).map(|s| Arc::clone(s.value()));
        let scored: Vec<(TableEntry, f32)> = match (&self.embeddings, snapshot) {
            (Some(client), Some(snapshot)) => match client.embed_one(user_request).await {
                Ok(query) => snapshot.top_k(&query, top_k),
                Err(e) => {
                    tracing::warn!("Table lookup degraded to pinned set: {}", e);
                    vec![]
                },
            },
            _ => vec![],
        };

        let mut filtered: Vec<String> = scored
            .iter()
            .filter(|(_, score)| *score >= threshold)
            .map(|(entry, _)| entry.qualified_name.clone())
            .collect();

        if filtered.is_empty() {
            // Nothing cleared the threshold: better too much context than none
            filtered = scored
                .iter()
                .map(|(entry, _)| entry.qualified_name.clone())
                .collect();
        }

        for name in pinned {
            if !result.contains(name) {
                result.push(name.clone());
            }
        }
        for name in filtered {
            if !result.contains(&name) {
                result.push(name);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_snapshot_top_k_ordering() {
        let snapshot = IndexSnapshot {
            items: vec![
                ("far".to_string(), vec![0.0, 1.0]),
                ("near".to_string(), vec![1.0, 0.0]),
                ("mid".to_string(), vec![0.7, 0.7]),
            ],
        };
        let top = snapshot.top_k(&[1.0, 0.0], 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "near");
        assert_eq!(top[1].0, "mid");
    }

    #[tokio::test]
    async fn test_disabled_service_degrades() {
        let service = RelevanceService::new(None);
        assert!(!service.is_enabled());

        let examples = service.relevant_examples("anything", "p", 5).await;
        assert!(examples.is_empty());

        let pinned = vec!["sales.core".to_string()];
        let tables = service.relevant_tables("anything", "p", 5, 0.3, &pinned).await;
        assert_eq!(tables, pinned);

        assert_eq!(service.rebuild_examples("p", vec![]).await.unwrap(), 0);
    }

    #[test]
    fn test_example_serde() {
        let example = QueryExample {
            description: "count users".into(),
            sql: "SELECT COUNT(*) AS n FROM users".into(),
            tables: vec!["public.users".into()],
        };
        let json = serde_json::to_string(&example).unwrap();
        let back: QueryExample = serde_json::from_str(&json).unwrap();
        assert_eq!(example, back);
    }
}
