//! Pagination/sort rewriter.
//!
//! Wraps arbitrary user SQL in a deterministic sorted+paginated envelope,
//! optionally carrying a total-row count, without executing the inner query
//! twice on dialects that materialize CTEs. The original SQL always appears
//! as live text in the output.

use serde::{Deserialize, Serialize};

use crate::models::Column;
use crate::services::dialect::Dialect;
use crate::utils::error::ApiError;
use crate::utils::is_simple_identifier;

pub const TOTAL_ROWS_ALIAS: &str = "total_rows";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaginateError {
    #[error("query SQL is empty")]
    EmptySql,

    #[error("invalid sort column '{column}'")]
    InvalidSortColumn { column: String, valid: Vec<String> },
}

impl From<PaginateError> for ApiError {
    fn from(err: PaginateError) -> Self {
        match err {
            PaginateError::EmptySql => ApiError::validation("query SQL is empty"),
            PaginateError::InvalidSortColumn { column, valid } => {
                ApiError::InvalidSortColumn { column, valid: valid.join(", ") }
            },
        }
    }
}

/// The rewritten statement plus its named binds. Placeholders use `:limit`
/// and `:offset`; the warehouse client binds them at execution time.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub sql: String,
}

/// Build the pagination envelope around `user_sql`.
///
/// `sort_by`, when present, must be a simple identifier naming one of
/// `columns` (case-insensitive); violations are client errors.
pub fn build(
    user_sql: &str,
    sort_by: Option<&str>,
    sort_order: SortOrder,
    include_total_count: bool,
    dialect: Dialect,
    columns: &[Column],
) -> Result<PageQuery, PaginateError> {
    let stripped = strip_trailing_clauses(user_sql);
    let inner = stripped.trim().trim_end_matches(';').trim();
    if inner.is_empty() {
        return Err(PaginateError::EmptySql);
    }

    let sort_by = match sort_by.map(str::trim).filter(|s| !s.is_empty()) {
        Some(candidate) => {
            let declared_ok = columns
                .iter()
                .any(|c| c.column_name.eq_ignore_ascii_case(candidate));
            if !is_simple_identifier(candidate) || !declared_ok {
                return Err(PaginateError::InvalidSortColumn {
                    column: candidate.to_string(),
                    valid: columns.iter().map(|c| c.column_name.clone()).collect(),
                });
            }
            Some(candidate)
        },
        None => None,
    };

    let sql = if dialect.materializes_ctes() {
        build_cte_envelope(inner, sort_by, sort_order, include_total_count, dialect)
    } else {
        build_derived_envelope(inner, sort_by, sort_order, include_total_count)
    };

    Ok(PageQuery { sql })
}

/// Envelope for dialects whose planner materializes a `WITH` clause: a window
/// count over the CTE yields the total in a single pass.
fn build_cte_envelope(
    inner: &str,
    sort_by: Option<&str>,
    sort_order: SortOrder,
    include_total_count: bool,
    dialect: Dialect,
) -> String {
    let mut sql = String::new();
    sql.push_str("WITH paged AS (\n");
    sql.push_str(inner);
    sql.push_str("\n)\nSELECT paged.*");
    if include_total_count {
        sql.push_str(&format!(", COUNT(*) OVER () AS {}", TOTAL_ROWS_ALIAS));
    }
    sql.push_str("\nFROM paged");
    if let Some(column) = sort_by {
        // Engines that fold unquoted identifiers need the projection's exact case
        let column = if dialect.folds_unquoted_identifiers() {
            format!("\"{}\"", column)
        } else {
            column.to_string()
        };
        sql.push_str(&format!("\nORDER BY {} {}", column, sort_order.as_sql()));
    }
    sql.push_str("\nLIMIT :limit OFFSET :offset");
    sql
}

/// Envelope for the distributed-federation engine (Trino), which may inline
/// CTEs: a window count could re-execute the inner query per split, so the
/// total comes from a scalar subquery instead, and identifiers are quoted
/// because the engine lowercases unquoted names. Trino also expects OFFSET
/// before LIMIT.
fn build_derived_envelope(
    inner: &str,
    sort_by: Option<&str>,
    sort_order: SortOrder,
    include_total_count: bool,
) -> String {
    let mut sql = String::new();
    sql.push_str("SELECT paged.*");
    if include_total_count {
        sql.push_str(&format!(
            ", (SELECT COUNT(*) FROM (\n{}\n) counted) AS \"{}\"",
            inner, TOTAL_ROWS_ALIAS
        ));
    }
    sql.push_str("\nFROM (\n");
    sql.push_str(inner);
    sql.push_str("\n) paged");
    match sort_by {
        Some(column) => {
            sql.push_str(&format!("\nORDER BY \"{}\" {}", column, sort_order.as_sql()));
        },
        // Deterministic pagination needs some total order
        None => sql.push_str("\nORDER BY 1 ASC"),
    }
    sql.push_str("\nOFFSET :offset LIMIT :limit");
    sql
}

/// Strip a trailing `ORDER BY … LIMIT … OFFSET … / FETCH FIRST …` from the
/// end of the statement. The scan is anchored to depth 0, so clauses inside
/// CTEs and subqueries are never touched.
pub fn strip_trailing_clauses(sql: &str) -> String {
    if let Some(pos) = first_top_level_trailing_clause(sql) {
        sql[..pos].trim_end().to_string()
    } else {
        sql.trim_end().to_string()
    }
}

/// Byte offset of the earliest depth-0 ORDER BY / LIMIT / OFFSET / FETCH
/// keyword, skipping string literals, quoted identifiers, and comments.
fn first_top_level_trailing_clause(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0;
    let mut earliest: Option<usize> = None;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' | '"' | '`' => {
                i = skip_quoted(bytes, i, c);
                continue;
            },
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            },
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                continue;
            },
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let w = bytes[i] as char;
                    if w.is_ascii_alphanumeric() || w == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                // Qualified references like t.offset are identifiers, not clauses
                let qualified = start > 0 && bytes[start - 1] == b'.';
                if depth == 0 && !qualified {
                    let word = sql[start..i].to_ascii_uppercase();
                    let hit = match word.as_str() {
                        "LIMIT" | "OFFSET" => true,
                        "ORDER" => next_word_is(sql, i, "BY"),
                        "FETCH" => next_word_is(sql, i, "FIRST") || next_word_is(sql, i, "NEXT"),
                        _ => false,
                    };
                    if hit {
                        earliest = Some(earliest.map_or(start, |e| e.min(start)));
                    }
                }
                continue;
            },
            _ => {},
        }
        i += 1;
    }

    earliest
}

fn skip_quoted(bytes: &[u8], start: usize, quote: char) -> usize {
    let q = quote as u8;
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == q {
            // Doubled quote is an escape
            if bytes.get(i + 1) == Some(&q) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        // Backslash escapes inside string literals
        if q == b'\'' && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        i += 1;
    }
    i
}

fn next_word_is(sql: &str, from: usize, expected: &str) -> bool {
    let rest = sql[from..].trim_start();
    rest.len() >= expected.len() && rest[..expected.len()].eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<Column> {
        names.iter().map(|n| Column::named(*n)).collect()
    }

    #[test]
    fn test_strip_simple_trailing_clauses() {
        assert_eq!(
            strip_trailing_clauses("SELECT a FROM t ORDER BY a LIMIT 10 OFFSET 5"),
            "SELECT a FROM t"
        );
        assert_eq!(strip_trailing_clauses("SELECT a FROM t LIMIT 10"), "SELECT a FROM t");
        assert_eq!(
            strip_trailing_clauses("SELECT a FROM t FETCH FIRST 10 ROWS ONLY"),
            "SELECT a FROM t"
        );
    }

    #[test]
    fn test_strip_leaves_cte_clauses_alone() {
        let sql = "WITH top AS (SELECT a FROM t ORDER BY a LIMIT 5) SELECT a FROM top";
        assert_eq!(strip_trailing_clauses(sql), sql);
    }

    #[test]
    fn test_strip_leaves_subquery_clauses_alone() {
        let sql = "SELECT a FROM (SELECT a FROM t ORDER BY a LIMIT 3) s WHERE a > 1";
        assert_eq!(strip_trailing_clauses(sql), sql);
    }

    #[test]
    fn test_strip_mixed_inner_and_outer() {
        let sql = "SELECT a FROM (SELECT a FROM t LIMIT 3) s ORDER BY a DESC LIMIT 1";
        assert_eq!(
            strip_trailing_clauses(sql),
            "SELECT a FROM (SELECT a FROM t LIMIT 3) s"
        );
    }

    #[test]
    fn test_strip_ignores_keywords_in_strings_and_comments() {
        let sql = "SELECT a, 'use LIMIT here' AS hint FROM t -- LIMIT note";
        assert_eq!(strip_trailing_clauses(sql), sql.trim_end());

        let quoted = r#"SELECT "limit" FROM t"#;
        assert_eq!(strip_trailing_clauses(quoted), quoted);
    }

    #[test]
    fn test_order_as_identifier_not_stripped() {
        let sql = "SELECT order_id FROM orders";
        assert_eq!(strip_trailing_clauses(sql), sql);
    }

    #[test]
    fn test_qualified_offset_column_not_stripped() {
        let sql = "SELECT t.offset, u.fetch FROM t JOIN u ON t.id = u.id";
        assert_eq!(strip_trailing_clauses(sql), sql);
    }

    #[test]
    fn test_build_cte_envelope_with_count() {
        let page = build(
            "SELECT user_id, user_name FROM users",
            Some("user_id"),
            SortOrder::Desc,
            true,
            Dialect::Clickhouse,
            &cols(&["user_id", "user_name"]),
        )
        .unwrap();

        assert!(page.sql.contains("WITH paged AS ("));
        assert!(page.sql.contains("SELECT user_id, user_name FROM users"));
        assert!(page.sql.contains("COUNT(*) OVER () AS total_rows"));
        assert!(page.sql.contains("ORDER BY user_id DESC"));
        assert!(page.sql.contains("LIMIT :limit OFFSET :offset"));
    }

    #[test]
    fn test_build_without_sort_or_count() {
        let page = build(
            "SELECT a FROM t",
            None,
            SortOrder::Asc,
            false,
            Dialect::Postgres,
            &cols(&["a"]),
        )
        .unwrap();

        assert!(!page.sql.contains("ORDER BY"));
        assert!(!page.sql.contains("COUNT(*)"));
        assert!(page.sql.contains("LIMIT :limit OFFSET :offset"));
    }

    #[test]
    fn test_build_trino_quotes_and_scalar_subquery() {
        let user_sql =
            "WITH t AS (SELECT userId, name FROM postgresql.public.users) SELECT * FROM t";
        let page = build(
            user_sql,
            Some("userId"),
            SortOrder::Asc,
            true,
            Dialect::Trino,
            &cols(&["userId", "name"]),
        )
        .unwrap();

        assert!(page.sql.contains("ORDER BY \"userId\" ASC"));
        assert!(page.sql.contains("(SELECT COUNT(*) FROM ("));
        assert!(!page.sql.contains("OVER ()"));
        // Original CTE text is live in the envelope
        assert!(page.sql.contains("WITH t AS (SELECT userId, name FROM postgresql.public.users)"));
        assert!(page.sql.contains("OFFSET :offset LIMIT :limit"));
    }

    #[test]
    fn test_build_postgres_quotes_sort_column() {
        let page = build(
            "SELECT id AS \"userId\" FROM users",
            Some("userId"),
            SortOrder::Asc,
            false,
            Dialect::Postgres,
            &cols(&["userId"]),
        )
        .unwrap();
        assert!(page.sql.contains("ORDER BY \"userId\" ASC"));
        assert!(page.sql.contains("WITH paged AS ("));
    }

    #[test]
    fn test_build_trino_defaults_to_positional_order() {
        let page = build(
            "SELECT a FROM t",
            None,
            SortOrder::Asc,
            false,
            Dialect::Trino,
            &cols(&["a"]),
        )
        .unwrap();
        assert!(page.sql.contains("ORDER BY 1 ASC"));
    }

    #[test]
    fn test_build_replaces_existing_trailing_clauses() {
        let page = build(
            "SELECT a FROM t ORDER BY a ASC LIMIT 100",
            Some("a"),
            SortOrder::Desc,
            false,
            Dialect::Mysql,
            &cols(&["a"]),
        )
        .unwrap();
        assert_eq!(page.sql.matches("ORDER BY").count(), 1);
        assert!(page.sql.contains("ORDER BY a DESC"));
        assert_eq!(page.sql.matches("LIMIT").count(), 1);
    }

    #[test]
    fn test_invalid_sort_column_rejected() {
        let err = build(
            "SELECT user_id FROM users",
            Some("nonexistent"),
            SortOrder::Asc,
            false,
            Dialect::Trino,
            &cols(&["user_id", "user_name"]),
        )
        .unwrap_err();

        match err {
            PaginateError::InvalidSortColumn { column, valid } => {
                assert_eq!(column, "nonexistent");
                assert_eq!(valid, vec!["user_id", "user_name"]);
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_expression_sort_column_rejected() {
        let err = build(
            "SELECT a FROM t",
            Some("a; DROP TABLE t"),
            SortOrder::Asc,
            false,
            Dialect::Trino,
            &cols(&["a"]),
        )
        .unwrap_err();
        assert!(matches!(err, PaginateError::InvalidSortColumn { .. }));
    }

    #[test]
    fn test_sort_column_case_insensitive() {
        let page = build(
            "SELECT user_id FROM users",
            Some("USER_ID"),
            SortOrder::Asc,
            false,
            Dialect::Mysql,
            &cols(&["user_id"]),
        )
        .unwrap();
        assert!(page.sql.contains("ORDER BY USER_ID ASC"));
    }

    #[test]
    fn test_empty_sql_rejected() {
        let err = build("  ;  ", None, SortOrder::Asc, false, Dialect::Mysql, &[]).unwrap_err();
        assert!(matches!(err, PaginateError::EmptySql));
    }

    #[test]
    fn test_original_sql_never_commented() {
        let user_sql = "SELECT a FROM t";
        for dialect in [Dialect::Clickhouse, Dialect::Trino, Dialect::Postgres] {
            let page = build(user_sql, None, SortOrder::Asc, true, dialect, &cols(&["a"])).unwrap();
            let before_comment = page.sql.split("--").next().unwrap_or(&page.sql);
            assert!(before_comment.contains(user_sql));
        }
    }
}
