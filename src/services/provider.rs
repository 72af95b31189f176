//! Metadata provider: the tool interface the agentic flow consumes.
//!
//! Four operations: `describe_provider`, `get_prompt_bundle`,
//! `explain_analyze`, and the `log_successful_query` learning hook.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::services::agent::repository::AgentRepository;
use crate::services::cache::CacheHandle;
use crate::services::schema::SchemaService;
use crate::services::sqlcheck::{SqlValidation, SqlValidator};
use crate::services::vector::{QueryExample, RelevanceService};
use crate::services::warehouse::WarehousePool;
use crate::utils::error::ApiResult;

#[derive(Debug, Clone, Serialize)]
pub struct ProfileInfo {
    pub name: String,
    pub dialect: String,
    pub pinned_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub profiles: Vec<ProfileInfo>,
    pub embeddings_enabled: bool,
    pub slots: Vec<String>,
}

/// Everything the prompt needs about the warehouse for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBundle {
    pub schema_block: String,
    pub examples: Vec<QueryExample>,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_tables: Option<Vec<String>>,
}

pub struct MetadataProvider {
    warehouses: Arc<WarehousePool>,
    schema: Arc<SchemaService>,
    relevance: Arc<RelevanceService>,
    validator: Arc<SqlValidator>,
    repository: Arc<AgentRepository>,
    assembler: Arc<crate::services::prompt::PromptAssembler>,
    cache: CacheHandle,
    agent_config: AgentConfig,
    client: String,
    env: String,
    bundle_ttl: Duration,
}

impl MetadataProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        warehouses: Arc<WarehousePool>,
        schema: Arc<SchemaService>,
        relevance: Arc<RelevanceService>,
        validator: Arc<SqlValidator>,
        repository: Arc<AgentRepository>,
        assembler: Arc<crate::services::prompt::PromptAssembler>,
        cache: CacheHandle,
        agent_config: AgentConfig,
        client: Option<String>,
        env: Option<String>,
        bundle_ttl: Duration,
    ) -> Self {
        Self {
            warehouses,
            schema,
            relevance,
            validator,
            repository,
            assembler,
            cache,
            agent_config,
            client: client.unwrap_or_else(|| "-".to_string()),
            env: env.unwrap_or_else(|| "-".to_string()),
            bundle_ttl,
        }
    }

    /// Profiles and reachable resources
    pub fn describe_provider(&self) -> ProviderInfo {
        let profiles = self
            .warehouses
            .profile_names()
            .into_iter()
            .map(|name| {
                let dialect = self
                    .warehouses
                    .dialect_for(&name)
                    .map(|d| d.as_str().to_string())
                    .unwrap_or_default();
                let pinned_tables = self
                    .warehouses
                    .profile_config(&name)
                    .map(|c| c.pinned_tables.clone())
                    .unwrap_or_default();
                ProfileInfo { name, dialect, pinned_tables }
            })
            .collect();

        ProviderInfo {
            profiles,
            embeddings_enabled: self.relevance.is_enabled(),
            slots: self.assembler.slot_names(),
        }
    }

    /// Schema block + examples + instructions for a profile. The
    /// request-independent variant is cached by (profile, client, env); the
    /// request-scoped variant never is (unbounded key space).
    pub async fn get_prompt_bundle(
        &self,
        profile: &str,
        user_request: Option<&str>,
    ) -> ApiResult<PromptBundle> {
        match user_request {
            None => self.full_bundle(profile).await,
            Some(user_request) => self.scoped_bundle(profile, user_request).await,
        }
    }

    async fn full_bundle(&self, profile: &str) -> ApiResult<PromptBundle> {
        let cache_key = CacheHandle::key("bundle", &[profile, &self.client, &self.env]);
        if let Some(cached) = self.cache.get(&cache_key).await
            && let Ok(bundle) = serde_json::from_str::<PromptBundle>(&cached)
        {
            return Ok(bundle);
        }

        let schema_block = self.schema.full_schema(profile, true).await?;
        let examples = self.repository.learned_examples(profile).await?;
        let bundle = PromptBundle {
            schema_block,
            examples,
            instructions: self.instructions_for(profile)?,
            selected_tables: None,
        };

        if let Ok(serialized) = serde_json::to_string(&bundle) {
            self.cache.set(&cache_key, &serialized, self.bundle_ttl).await;
        }
        Ok(bundle)
    }

    async fn scoped_bundle(&self, profile: &str, user_request: &str) -> ApiResult<PromptBundle> {
        let pinned = self
            .warehouses
            .profile_config(profile)
            .map(|c| c.pinned_tables.clone())
            .unwrap_or_default();

        let tables = self
            .relevance
            .relevant_tables(
                user_request,
                profile,
                self.agent_config.top_k_tables,
                self.agent_config.table_score_threshold,
                &pinned,
            )
            .await;

        let schema_block = if tables.is_empty() {
            self.schema.full_schema(profile, true).await?
        } else {
            self.schema.filtered_schema(profile, &tables, true).await?
        };

        let examples = self
            .relevance
            .relevant_examples(user_request, profile, self.agent_config.top_k_examples)
            .await
            .into_iter()
            .map(|scored| scored.example)
            .collect();

        Ok(PromptBundle {
            schema_block,
            examples,
            instructions: self.instructions_for(profile)?,
            selected_tables: if tables.is_empty() { None } else { Some(tables) },
        })
    }

    fn instructions_for(&self, profile: &str) -> ApiResult<String> {
        let dialect = self.warehouses.dialect_for(profile)?;
        Ok(format!(
            "Write {} SQL. Use only tables and columns from the schema block. \
             Alias every computed projection with AS.",
            dialect.as_str()
        ))
    }

    /// Validate SQL via the warehouse, enriching known failure classes with
    /// up to three nearest successful examples.
    pub async fn explain_analyze(&self, sql: &str, profile: &str) -> ApiResult<SqlValidation> {
        let mut validation = self.validator.explain_analyze(sql, profile).await?;

        if !validation.valid && validation.repair_guidance.is_some() {
            let neighbors = self.relevance.relevant_examples(sql, profile, 3).await;
            if !neighbors.is_empty() {
                let mut guidance = validation.repair_guidance.take().unwrap_or_default();
                guidance.push_str("\nKnown-good examples:");
                for scored in neighbors {
                    guidance.push_str(&format!(
                        "\n- {}: {}",
                        scored.example.description, scored.example.sql
                    ));
                }
                validation.repair_guidance = Some(guidance);
            }
        }

        Ok(validation)
    }

    /// Learning hook: remember a query that validated and served results so
    /// future requests retrieve it as an example. No-op when embeddings are
    /// disabled beyond the durable record.
    pub async fn log_successful_query(
        &self,
        query_id: &str,
        sql: &str,
        description: &str,
        profile: &str,
        previous_error: Option<&str>,
        previous_sql: Option<&str>,
    ) -> ApiResult<()> {
        self.repository
            .insert_learned_example(profile, description, sql, previous_error, previous_sql)
            .await?;

        self.relevance
            .add_example(
                profile,
                QueryExample {
                    description: description.to_string(),
                    sql: sql.to_string(),
                    tables: vec![],
                },
            )
            .await;

        tracing::debug!("Logged successful query {} for profile '{}'", query_id, profile);
        Ok(())
    }
}
