//! Warehouse driver identifier → canonical SQL dialect mapping.
//!
//! Used by the SQL parser and the pagination rewriter, which must agree on
//! the dialect for a profile.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Canonical dialect names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Clickhouse,
    Postgres,
    Mysql,
    Sqlite,
    Tsql,
    Oracle,
    Trino,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clickhouse => "clickhouse",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Tsql => "tsql",
            Self::Oracle => "oracle",
            Self::Trino => "trino",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clickhouse" => Some(Self::Clickhouse),
            "postgres" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "sqlite" => Some(Self::Sqlite),
            "tsql" => Some(Self::Tsql),
            "oracle" => Some(Self::Oracle),
            "trino" => Some(Self::Trino),
            _ => None,
        }
    }

    /// Dialects where an unquoted identifier is folded to lowercase by the
    /// engine, so the rewriter must quote to preserve case
    pub fn folds_unquoted_identifiers(&self) -> bool {
        matches!(self, Self::Trino | Self::Postgres | Self::Oracle)
    }

    /// Whether the planner materializes a `WITH` clause, making a window
    /// count over the CTE a single-pass total
    pub fn materializes_ctes(&self) -> bool {
        !matches!(self, Self::Trino)
    }
}

/// Map a warehouse driver/engine identifier to its canonical dialect.
/// Unknown drivers fall back to `default_dialect` with a warning.
pub fn detect(driver_or_engine: &str, default_dialect: Dialect) -> Dialect {
    let normalized = driver_or_engine.trim().to_ascii_lowercase();
    let mapped = match normalized.as_str() {
        "clickhouse" => Some(Dialect::Clickhouse),
        "postgresql" | "postgres" => Some(Dialect::Postgres),
        "mysql" => Some(Dialect::Mysql),
        "sqlite" => Some(Dialect::Sqlite),
        "mssql" | "tsql" => Some(Dialect::Tsql),
        "oracle" => Some(Dialect::Oracle),
        "trino" => Some(Dialect::Trino),
        _ => None,
    };

    mapped.unwrap_or_else(|| {
        tracing::warn!(
            "Unknown warehouse driver '{}', falling back to dialect '{}'",
            driver_or_engine,
            default_dialect.as_str()
        );
        default_dialect
    })
}

static DIALECT_CACHE: Lazy<DashMap<String, Dialect>> = Lazy::new(DashMap::new);

/// Cached variant of [`detect`]; the mapping is stable for a process lifetime
pub fn detect_cached(driver_or_engine: &str, default_dialect: Dialect) -> Dialect {
    if let Some(found) = DIALECT_CACHE.get(driver_or_engine) {
        return *found;
    }
    let dialect = detect(driver_or_engine, default_dialect);
    DIALECT_CACHE.insert(driver_or_engine.to_string(), dialect);
    dialect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_driver_mapping() {
        assert_eq!(detect("clickhouse", Dialect::Trino), Dialect::Clickhouse);
        assert_eq!(detect("postgresql", Dialect::Trino), Dialect::Postgres);
        assert_eq!(detect("mysql", Dialect::Trino), Dialect::Mysql);
        assert_eq!(detect("sqlite", Dialect::Trino), Dialect::Sqlite);
        assert_eq!(detect("mssql", Dialect::Trino), Dialect::Tsql);
        assert_eq!(detect("oracle", Dialect::Trino), Dialect::Oracle);
        assert_eq!(detect("trino", Dialect::Clickhouse), Dialect::Trino);
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert_eq!(detect(" ClickHouse ", Dialect::Trino), Dialect::Clickhouse);
        assert_eq!(detect("POSTGRESQL", Dialect::Trino), Dialect::Postgres);
    }

    #[test]
    fn test_unknown_driver_falls_back() {
        assert_eq!(detect("duckdb", Dialect::Trino), Dialect::Trino);
        assert_eq!(detect("", Dialect::Postgres), Dialect::Postgres);
    }

    #[test]
    fn test_cached_detect_is_stable() {
        assert_eq!(detect_cached("clickhouse", Dialect::Trino), Dialect::Clickhouse);
        assert_eq!(detect_cached("clickhouse", Dialect::Postgres), Dialect::Clickhouse);
    }

    #[test]
    fn test_dialect_traits() {
        assert!(Dialect::Trino.folds_unquoted_identifiers());
        assert!(!Dialect::Clickhouse.folds_unquoted_identifiers());
        assert!(!Dialect::Trino.materializes_ctes());
        assert!(Dialect::Postgres.materializes_ctes());
    }

    #[test]
    fn test_parse_round_trip() {
        for d in [
            Dialect::Clickhouse,
            Dialect::Postgres,
            Dialect::Mysql,
            Dialect::Sqlite,
            Dialect::Tsql,
            Dialect::Oracle,
            Dialect::Trino,
        ] {
            assert_eq!(Dialect::parse(d.as_str()), Some(d));
        }
        assert_eq!(Dialect::parse("nope"), None);
    }
}
