//! Schema introspector & prompt bundler: live catalog walks joined with
//! human-authored descriptors, emitted as a compact prompt-ready block,
//! optionally restricted to a relevant table set.

pub mod descriptor;

pub use descriptor::{SchemaDescriptor, TableDescriptor};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::services::cache::CacheHandle;
use crate::services::vector::RelevanceService;
use crate::services::warehouse::{TableInfo, WarehousePool};
use crate::utils::error::ApiResult;

pub struct SchemaService {
    warehouses: Arc<WarehousePool>,
    relevance: Arc<RelevanceService>,
    cache: CacheHandle,
    /// Profile → descriptor, loaded once at startup
    descriptors: HashMap<String, SchemaDescriptor>,
    /// Cache key scoping (overlays can change the descriptor view per client)
    client: String,
    env: String,
    full_schema_ttl: Duration,
}

impl SchemaService {
    pub fn new(
        warehouses: Arc<WarehousePool>,
        relevance: Arc<RelevanceService>,
        cache: CacheHandle,
        descriptors: HashMap<String, SchemaDescriptor>,
        client: Option<String>,
        env: Option<String>,
        full_schema_ttl: Duration,
    ) -> Self {
        Self {
            warehouses,
            relevance,
            cache,
            descriptors,
            client: client.unwrap_or_else(|| "-".to_string()),
            env: env.unwrap_or_else(|| "-".to_string()),
            full_schema_ttl,
        }
    }

    fn descriptor(&self, profile: &str) -> Option<&SchemaDescriptor> {
        self.descriptors.get(profile)
    }

    /// Full prompt-ready schema for a profile. Cached by
    /// (profile, client, env, with_examples), TTL of order one hour.
    pub async fn full_schema(&self, profile: &str, with_examples: bool) -> ApiResult<String> {
        let cache_key = CacheHandle::key(
            "schema",
            &[profile, &self.client, &self.env, if with_examples { "ex" } else { "plain" }],
        );
        if let Some(cached) = self.cache.get(&cache_key).await {
            tracing::debug!("Schema cache hit for profile '{}'", profile);
            return Ok(cached);
        }

        let tables = self.warehouses.get(profile)?.introspect().await?;
        let block = render_schema_block(&tables, self.descriptor(profile), with_examples);

        self.cache.set(&cache_key, &block, self.full_schema_ttl).await;
        Ok(block)
    }

    /// Same projection restricted to `table_set`. Never cached: the key
    /// space is unbounded.
    pub async fn filtered_schema(
        &self,
        profile: &str,
        table_set: &[String],
        with_examples: bool,
    ) -> ApiResult<String> {
        let tables = self.warehouses.get(profile)?.introspect().await?;
        let filtered: Vec<TableInfo> = tables
            .into_iter()
            .filter(|t| {
                let fqn = t.qualified_name();
                table_set
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(&fqn))
            })
            .collect();
        Ok(render_schema_block(&filtered, self.descriptor(profile), with_examples))
    }

    /// Rebuild the per-profile vector indices from live introspection, the
    /// descriptor, and previously learned examples. Offline/startup job;
    /// request paths only read the resulting snapshots.
    pub async fn rebuild_indices(
        &self,
        profile: &str,
        learned: Vec<crate::services::vector::QueryExample>,
    ) -> ApiResult<()> {
        if !self.relevance.is_enabled() {
            tracing::debug!("Embeddings disabled; skipping index rebuild for '{}'", profile);
            return Ok(());
        }

        let tables = self.warehouses.get(profile)?.introspect().await?;
        let descriptor = self.descriptor(profile);

        let entries: Vec<crate::services::vector::TableEntry> = tables
            .iter()
            .map(|t| {
                let fqn = t.qualified_name();
                let description = descriptor
                    .and_then(|d| d.table(&fqn))
                    .and_then(|t| t.description.clone())
                    .unwrap_or_else(|| {
                        let columns: Vec<&str> =
                            t.columns.iter().map(|c| c.name.as_str()).collect();
                        format!("columns: {}", columns.join(", "))
                    });
                crate::services::vector::TableEntry { qualified_name: fqn, description }
            })
            .collect();

        let mut examples = descriptor.map(|d| d.examples.clone()).unwrap_or_default();
        examples.extend(learned);

        if let Err(e) = self.relevance.rebuild_tables(profile, entries).await {
            tracing::warn!("Table index rebuild failed for '{}': {}", profile, e);
        }
        if let Err(e) = self.relevance.rebuild_examples(profile, examples).await {
            tracing::warn!("Example index rebuild failed for '{}': {}", profile, e);
        }

        // Index contents changed; cached schema blocks may embed stale views.
        // The trailing delimiter keeps profiles sharing a name prefix
        // (e.g. "prod" vs "prod_eu") untouched.
        let prefix = format!("{}:", CacheHandle::key("schema", &[profile]));
        self.cache.delete_prefix(&prefix).await;
        Ok(())
    }
}

/// Emit the textual schema block: grouped by schema, then table,
/// column by column, joined with descriptor annotations.
pub fn render_schema_block(
    tables: &[TableInfo],
    descriptor: Option<&SchemaDescriptor>,
    with_examples: bool,
) -> String {
    let mut out = String::new();
    let mut current_schema: Option<&str> = None;

    for table in tables {
        if current_schema != Some(table.schema.as_str()) {
            if current_schema.is_some() {
                out.push('\n');
            }
            out.push_str(&format!("### Schema: {}\n", table.schema));
            current_schema = Some(table.schema.as_str());
        }

        let fqn = table.qualified_name();
        let annotations = descriptor.and_then(|d| d.table(&fqn));

        match annotations.and_then(|a| a.description.as_deref()) {
            Some(description) => out.push_str(&format!("Table {} -- {}\n", fqn, description)),
            None => out.push_str(&format!("Table {}\n", fqn)),
        }

        if let Some(annotations) = annotations {
            if !annotations.key_concepts.is_empty() {
                out.push_str(&format!(
                    "  Key concepts: {}\n",
                    annotations.key_concepts.join(", ")
                ));
            }
            if with_examples && !annotations.use_cases.is_empty() {
                out.push_str(&format!("  Use cases: {}\n", annotations.use_cases.join("; ")));
            }
        }

        out.push_str("  Columns:\n");
        for column in &table.columns {
            let nullability = if column.nullable { "" } else { ", not null" };
            match descriptor.and_then(|d| d.column_description(&fqn, &column.name)) {
                Some(description) => out.push_str(&format!(
                    "    - {} ({}{}): {}\n",
                    column.name, column.data_type, nullability, description
                )),
                None => out.push_str(&format!(
                    "    - {} ({}{})\n",
                    column.name, column.data_type, nullability
                )),
            }
        }
    }

    out
}
