//! Keyed blob cache with TTL and prefix invalidation.
//!
//! The cache is strictly an accelerator: a missing or failing backend never
//! surfaces as an error to callers. [`CacheHandle`] wraps a backend and turns
//! every failure into a logged degradation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Three-operation cache contract. Implementations are swappable; callers go
/// through [`CacheHandle`] and never see errors.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Per-process cache backed by a lock-free map. Expired entries are dropped
/// lazily on read and swept on write.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, DateTime<Utc>)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > Utc::now() {
                return Ok(Some(value.clone()));
            }
        }
        // Drop expired entry outside the read guard
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= Utc::now());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl)
                .map_err(|e| CacheError::Backend(format!("Invalid TTL: {}", e)))?;
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));

        // Opportunistic sweep keeps the map bounded under churn
        if self.entries.len() % 256 == 0 {
            let now = Utc::now();
            self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }
}

// ============================================================================
// SQLite backend (cross-process, uses the operational store)
// ============================================================================

pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM cache_entries WHERE key = ? AND expires_at > CURRENT_TIMESTAMP",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl)
                .map_err(|e| CacheError::Backend(format!("Invalid TTL: {}", e)))?;
        sqlx::query(
            r#"INSERT INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                              expires_at = excluded.expires_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        // ESCAPE handles profiles/clients containing SQL wildcards
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let result = sqlx::query("DELETE FROM cache_entries WHERE key LIKE ? ESCAPE '\\'")
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Shared facade handed to services. `CacheHandle::disabled()` is a fully
/// functional no-op, so callers never branch on availability.
#[derive(Clone)]
pub struct CacheHandle {
    store: Option<Arc<dyn CacheStore>>,
}

impl CacheHandle {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Build a cache key from a logical prefix and stable argument tuple
    pub fn key(prefix: &str, parts: &[&str]) -> String {
        let mut key = String::from(prefix);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Cache get failed for '{}', recomputing: {}", key, e);
                None
            },
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(store) = &self.store
            && let Err(e) = store.set(key, value, ttl).await
        {
            tracing::warn!("Cache set failed for '{}': {}", key, e);
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) {
        if let Some(store) = &self.store {
            match store.delete_prefix(prefix).await {
                Ok(n) => tracing::debug!("Invalidated {} cache entries under '{}'", n, prefix),
                Err(e) => tracing::warn!("Cache invalidation failed for '{}': {}", prefix, e),
            }
        }
    }
}
