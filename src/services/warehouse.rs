//! Warehouse access behind a narrow trait.
//!
//! Profiles route to connection pools speaking the MySQL wire protocol
//! (ClickHouse, StarRocks/Doris front-ends, MySQL itself); other engines plug
//! in by implementing [`Warehouse`]. The engine bounds concurrent queries via
//! pool constraints; back-pressure is queueing inside the driver.

use async_trait::async_trait;
use dashmap::DashMap;
use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Pool, SslOpts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WarehouseProfileConfig;
use crate::services::dialect::{self, Dialect};
use crate::utils::error::{ApiError, ApiResult};

/// Failures crossing the warehouse boundary. The SQL validator classifies
/// `Query` messages further; `Timeout` maps to HTTP 504.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseFailure {
    #[error("warehouse query timed out after {0:?}")]
    Timeout(Duration),

    #[error("warehouse connection failed: {0}")]
    Connection(String),

    #[error("warehouse rejected query: {message}")]
    Query { message: String, code: Option<u16> },
}

impl From<WarehouseFailure> for ApiError {
    fn from(failure: WarehouseFailure) -> Self {
        match failure {
            WarehouseFailure::Timeout(_) => ApiError::WarehouseTimeout,
            WarehouseFailure::Connection(msg) => ApiError::WarehouseConnectionFailed(msg),
            WarehouseFailure::Query { message, .. } => ApiError::WarehouseError(message),
        }
    }
}

/// One column from live catalog introspection
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// One table from live catalog introspection, grouped by schema
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Result page from a data query
#[derive(Debug, Clone)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// The operations the core needs from any warehouse. Implementations must
/// enforce their own query timeout and surface it as
/// [`WarehouseFailure::Timeout`].
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run EXPLAIN (optionally EXPLAIN ANALYZE) and return the plan lines
    async fn explain(&self, sql: &str, analyze: bool) -> Result<Vec<String>, WarehouseFailure>;

    /// Run a query with named integer binds (used for :limit/:offset)
    async fn query_rows(
        &self,
        sql: &str,
        binds: &[(&str, i64)],
    ) -> Result<RowSet, WarehouseFailure>;

    /// Walk the live catalog
    async fn introspect(&self) -> Result<Vec<TableInfo>, WarehouseFailure>;
}

// ============================================================================
// MySQL-protocol implementation
// ============================================================================

pub struct MysqlWarehouse {
    pool: Pool,
    dialect: Dialect,
    database: Option<String>,
    query_timeout: Duration,
}

impl MysqlWarehouse {
    pub fn new(config: &WarehouseProfileConfig, dialect: Dialect) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .user(Some(&config.username))
            .pass(config.password.clone())
            .db_name(config.database.clone())
            .prefer_socket(false)
            .ssl_opts(None::<SslOpts>)
            .tcp_keepalive(Some(30_000_u32))
            .tcp_nodelay(true)
            .pool_opts(
                mysql_async::PoolOpts::default()
                    .with_constraints(
                        mysql_async::PoolConstraints::new(1, 10)
                            .unwrap_or_else(mysql_async::PoolConstraints::default),
                    )
                    .with_inactive_connection_ttl(Duration::from_secs(300))
                    .with_ttl_check_interval(Duration::from_secs(60)),
            );

        Self {
            pool: Pool::new(opts),
            dialect,
            database: config.database.clone(),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        }
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<mysql_async::Row>, WarehouseFailure> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| WarehouseFailure::Connection(e.to_string()))?;

        let result = tokio::time::timeout(self.query_timeout, conn.query::<mysql_async::Row, _>(sql))
            .await
            .map_err(|_| WarehouseFailure::Timeout(self.query_timeout))?
            .map_err(classify_driver_error)?;

        drop(conn);
        Ok(result)
    }
}

fn classify_driver_error(err: mysql_async::Error) -> WarehouseFailure {
    match err {
        mysql_async::Error::Server(server_err) => WarehouseFailure::Query {
            message: server_err.message.clone(),
            code: Some(server_err.code),
        },
        mysql_async::Error::Io(io_err) => WarehouseFailure::Connection(io_err.to_string()),
        other => WarehouseFailure::Query { message: other.to_string(), code: None },
    }
}

fn value_to_json(value: &mysql_async::Value) -> serde_json::Value {
    use mysql_async::Value;
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Int(v) => serde_json::json!(v),
        Value::UInt(v) => serde_json::json!(v),
        Value::Float(v) => serde_json::json!(v),
        Value::Double(v) => serde_json::json!(v),
        Value::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes).to_string();
            // Numeric-looking strings stay strings: the declared column type,
            // not the wire encoding, is authoritative for consumers
            serde_json::Value::String(text)
        },
        Value::Date(y, m, d, 0, 0, 0, 0) => {
            serde_json::Value::String(format!("{:04}-{:02}-{:02}", y, m, d))
        },
        Value::Date(y, m, d, h, mi, s, _) => serde_json::Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            y, m, d, h, mi, s
        )),
        Value::Time(neg, d, h, mi, s, _) => {
            let sign = if *neg { "-" } else { "" };
            serde_json::Value::String(format!("{}{:02}:{:02}:{:02}", sign, d * 24 + *h as u32, mi, s))
        },
    }
}

fn rows_to_rowset(rows: Vec<mysql_async::Row>) -> RowSet {
    let columns: Vec<String> = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|c| c.name_str().to_string())
                .collect()
        })
        .unwrap_or_default();

    let data = rows
        .into_iter()
        .map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).map(value_to_json).unwrap_or(serde_json::Value::Null))
                .collect()
        })
        .collect();

    RowSet { columns, rows: data }
}

/// Substitute named binds into the SQL. Only integer binds exist in this
/// system (:limit/:offset), so inlining is injection-safe and keeps the
/// statement portable across engines with differing placeholder syntax.
fn bind_named(sql: &str, binds: &[(&str, i64)]) -> String {
    let mut bound = sql.to_string();
    for (name, value) in binds {
        bound = bound.replace(&format!(":{}", name), &value.to_string());
    }
    bound
}

#[async_trait]
impl Warehouse for MysqlWarehouse {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn explain(&self, sql: &str, analyze: bool) -> Result<Vec<String>, WarehouseFailure> {
        let keyword = if analyze { "EXPLAIN ANALYZE" } else { "EXPLAIN" };
        let explain_sql = format!("{} {}", keyword, sql.trim().trim_end_matches(';'));

        let rows = self.run_query(&explain_sql).await?;
        let plan = rows
            .into_iter()
            .flat_map(|row| {
                (0..row.len())
                    .filter_map(|i| row.as_ref(i).map(value_to_json))
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(plan)
    }

    async fn query_rows(
        &self,
        sql: &str,
        binds: &[(&str, i64)],
    ) -> Result<RowSet, WarehouseFailure> {
        let bound = bind_named(sql, binds);
        let rows = self.run_query(&bound).await?;
        Ok(rows_to_rowset(rows))
    }

    async fn introspect(&self) -> Result<Vec<TableInfo>, WarehouseFailure> {
        let filter = match &self.database {
            Some(db) => format!("WHERE table_schema = '{}'", db.replace('\'', "''")),
            None => "WHERE table_schema NOT IN \
                     ('information_schema', 'performance_schema', 'mysql', 'sys', 'system')"
                .to_string(),
        };
        let sql = format!(
            "SELECT table_schema, table_name, column_name, data_type, is_nullable \
             FROM information_schema.columns {} \
             ORDER BY table_schema, table_name, ordinal_position",
            filter
        );

        let rows = self.run_query(&sql).await?;
        let rowset = rows_to_rowset(rows);

        let mut grouped: HashMap<(String, String), Vec<ColumnInfo>> = HashMap::new();
        let mut order: Vec<(String, String)> = Vec::new();
        for row in rowset.rows {
            let text = |i: usize| -> String {
                row.get(i)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let key = (text(0), text(1));
            if !grouped.contains_key(&key) {
                order.push(key.clone());
            }
            grouped.entry(key).or_default().push(ColumnInfo {
                name: text(2),
                data_type: text(3),
                nullable: text(4).eq_ignore_ascii_case("yes"),
            });
        }

        Ok(order
            .into_iter()
            .map(|(schema, table)| {
                let columns = grouped.remove(&(schema.clone(), table.clone())).unwrap_or_default();
                TableInfo { schema, table, columns }
            })
            .collect())
    }
}

// ============================================================================
// Profile routing
// ============================================================================

/// Routes profile names to shared warehouse handles.
///
/// Fast path is a lock-free read; pools are created on first use and kept for
/// the process lifetime.
pub struct WarehousePool {
    profiles: HashMap<String, WarehouseProfileConfig>,
    default_dialect: Dialect,
    pools: DashMap<String, Arc<dyn Warehouse>>,
}

impl WarehousePool {
    pub fn new(
        profiles: HashMap<String, WarehouseProfileConfig>,
        default_dialect: Dialect,
    ) -> Self {
        Self { profiles, default_dialect, pools: DashMap::new() }
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn profile_config(&self, profile: &str) -> Option<&WarehouseProfileConfig> {
        self.profiles.get(profile)
    }

    pub fn dialect_for(&self, profile: &str) -> ApiResult<Dialect> {
        let config = self
            .profiles
            .get(profile)
            .ok_or_else(|| ApiError::not_found(format!("Unknown warehouse profile: {}", profile)))?;
        Ok(dialect::detect_cached(&config.driver, self.default_dialect))
    }

    pub fn get(&self, profile: &str) -> ApiResult<Arc<dyn Warehouse>> {
        if let Some(pool) = self.pools.get(profile) {
            return Ok(Arc::clone(&pool));
        }

        let config = self
            .profiles
            .get(profile)
            .ok_or_else(|| ApiError::not_found(format!("Unknown warehouse profile: {}", profile)))?;
        let dialect = dialect::detect_cached(&config.driver, self.default_dialect);

        let warehouse: Arc<dyn Warehouse> = Arc::new(MysqlWarehouse::new(config, dialect));
        self.pools.insert(profile.to_string(), Arc::clone(&warehouse));

        tracing::info!(
            "Created warehouse pool for profile '{}' ({}:{}, dialect={})",
            profile,
            config.host,
            config.port,
            dialect.as_str()
        );

        Ok(warehouse)
    }

    /// Register a prebuilt handle (test stubs, non-MySQL engines)
    pub fn register(&self, profile: &str, warehouse: Arc<dyn Warehouse>) {
        self.pools.insert(profile.to_string(), warehouse);
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_named() {
        let sql = "SELECT * FROM t LIMIT :limit OFFSET :offset";
        assert_eq!(
            bind_named(sql, &[("limit", 10), ("offset", 20)]),
            "SELECT * FROM t LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_value_to_json() {
        use mysql_async::Value;
        assert_eq!(value_to_json(&Value::NULL), serde_json::Value::Null);
        assert_eq!(value_to_json(&Value::Int(7)), serde_json::json!(7));
        assert_eq!(
            value_to_json(&Value::Bytes(b"Ann".to_vec())),
            serde_json::Value::String("Ann".into())
        );
        assert_eq!(
            value_to_json(&Value::Date(2024, 5, 1, 0, 0, 0, 0)),
            serde_json::Value::String("2024-05-01".into())
        );
        assert_eq!(
            value_to_json(&Value::Date(2024, 5, 1, 13, 30, 5, 0)),
            serde_json::Value::String("2024-05-01 13:30:05".into())
        );
    }

    #[test]
    fn test_unknown_profile_is_not_found() {
        let pool = WarehousePool::new(HashMap::new(), Dialect::Trino);
        match pool.get("missing") {
            Err(err) => assert!(matches!(err, ApiError::NotFound(_))),
            Ok(_) => panic!("expected NotFound error"),
        }
    }

    #[test]
    fn test_register_and_dialect_for() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "ch".to_string(),
            WarehouseProfileConfig {
                host: "localhost".into(),
                port: 9004,
                username: "default".into(),
                password: None,
                driver: "clickhouse".into(),
                database: None,
                descriptor_path: None,
                pinned_tables: vec![],
                query_timeout_secs: 5,
            },
        );
        let pool = WarehousePool::new(profiles, Dialect::Trino);
        assert_eq!(pool.dialect_for("ch").unwrap(), Dialect::Clickhouse);
        assert_eq!(pool.profile_names(), vec!["ch"]);
    }
}
