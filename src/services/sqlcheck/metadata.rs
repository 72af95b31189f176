//! Metadata validator: enforces that a `QueryMetadata` object is internally
//! consistent with its SQL.
//!
//! The SQL is parsed in the warehouse dialect; the projection the parser
//! extracts must match the declared columns both ways (case-insensitive).

use sqlparser::ast::{Expr, Query, SelectItem, SetExpr, Statement};
use sqlparser::parser::Parser;

use crate::models::QueryMetadata;
use crate::services::dialect::Dialect;
use crate::utils::is_simple_identifier;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("SQL could not be parsed: {0}")]
    ParseFailed(String),

    #[error("metadata does not match SQL: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },
}

impl MetadataError {
    /// Feedback message appended to the model conversation on a failed attempt
    pub fn feedback_message(&self) -> String {
        match self {
            Self::ParseFailed(detail) => format!(
                "The SQL you produced could not be parsed: {}. \
                 Return corrected SQL together with the full metadata object.",
                detail
            ),
            Self::Invalid { errors } => format!(
                "The declared result columns do not match the SQL projection:\n- {}\n\
                 Fix the `columns` list so every projected column is declared \
                 exactly once, using the output alias as `column_name`.",
                errors.join("\n- ")
            ),
        }
    }
}

/// Validation outcome. `errors` block the attempt; `warnings` are advisory.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Projection column extracted from parsed SQL. `name` is None when the item
/// is an expression without an alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionColumn {
    pub name: Option<String>,
    pub display: String,
}

pub(crate) fn parser_dialect(dialect: Dialect) -> Box<dyn sqlparser::dialect::Dialect> {
    use sqlparser::dialect::{
        ClickHouseDialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
        SQLiteDialect,
    };
    match dialect {
        Dialect::Clickhouse => Box::new(ClickHouseDialect {}),
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::Mysql => Box::new(MySqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::Tsql => Box::new(MsSqlDialect {}),
        // No dedicated parser dialects; both are close enough to ANSI
        Dialect::Oracle | Dialect::Trino => Box::new(GenericDialect {}),
    }
}

/// Parse `sql` in `dialect` and return the ordered output columns of the
/// outermost query. Wildcard projections are rejected: the engine requires
/// explicitly enumerable columns.
pub fn output_columns(sql: &str, dialect: Dialect) -> Result<Vec<ProjectionColumn>, MetadataError> {
    let parsed = Parser::parse_sql(&*parser_dialect(dialect), sql)
        .map_err(|e| MetadataError::ParseFailed(e.to_string()))?;

    let query = parsed
        .iter()
        .find_map(|stmt| match stmt {
            Statement::Query(query) => Some(query),
            _ => None,
        })
        .ok_or_else(|| MetadataError::ParseFailed("statement is not a query".to_string()))?;

    projection_of(query)
}

fn projection_of(query: &Query) -> Result<Vec<ProjectionColumn>, MetadataError> {
    match query.body.as_ref() {
        SetExpr::Select(select) => {
            let mut columns = Vec::with_capacity(select.projection.len());
            for item in &select.projection {
                columns.push(projection_item(item)?);
            }
            Ok(columns)
        },
        SetExpr::Query(inner) => projection_of(inner),
        // UNION/INTERSECT/EXCEPT take column names from the left arm
        SetExpr::SetOperation { left, .. } => projection_of_set_expr(left),
        other => Err(MetadataError::ParseFailed(format!(
            "unsupported query body: {}",
            other
        ))),
    }
}

fn projection_of_set_expr(body: &SetExpr) -> Result<Vec<ProjectionColumn>, MetadataError> {
    match body {
        SetExpr::Select(select) => {
            let mut columns = Vec::with_capacity(select.projection.len());
            for item in &select.projection {
                columns.push(projection_item(item)?);
            }
            Ok(columns)
        },
        SetExpr::Query(inner) => projection_of(inner),
        SetExpr::SetOperation { left, .. } => projection_of_set_expr(left),
        other => Err(MetadataError::ParseFailed(format!(
            "unsupported query body: {}",
            other
        ))),
    }
}

fn projection_item(item: &SelectItem) -> Result<ProjectionColumn, MetadataError> {
    match item {
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Ok(ProjectionColumn {
            name: Some(ident.value.clone()),
            display: ident.value.clone(),
        }),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
            let last = parts
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default();
            Ok(ProjectionColumn { name: Some(last), display: expr_display(parts) })
        },
        SelectItem::ExprWithAlias { alias, expr } => Ok(ProjectionColumn {
            name: Some(alias.value.clone()),
            display: expr.to_string(),
        }),
        SelectItem::UnnamedExpr(expr) => {
            Ok(ProjectionColumn { name: None, display: expr.to_string() })
        },
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
            Err(MetadataError::Invalid {
                errors: vec![
                    "wildcard projection (*) is not allowed; enumerate every column".to_string(),
                ],
            })
        },
    }
}

fn expr_display(parts: &[sqlparser::ast::Ident]) -> String {
    parts
        .iter()
        .map(|p| p.value.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Validate a metadata object against its SQL. Returns a structured report;
/// use [`ensure_valid`] for the raising variant.
pub fn validate(meta: &QueryMetadata, dialect: Dialect) -> ValidationReport {
    let mut report = ValidationReport::default();

    let projection = match output_columns(&meta.sql, dialect) {
        Ok(projection) => projection,
        Err(MetadataError::ParseFailed(detail)) => {
            report.errors.push(format!("SQL parse failed: {}", detail));
            return report;
        },
        Err(MetadataError::Invalid { errors }) => {
            report.errors.extend(errors);
            return report;
        },
    };

    for column in &projection {
        match &column.name {
            Some(_) => {},
            None => report.errors.push(format!(
                "projection '{}' has no output name; add an AS alias",
                column.display
            )),
        }
    }

    let declared: Vec<String> = meta
        .columns
        .iter()
        .map(|c| c.column_name.to_ascii_lowercase())
        .collect();
    let projected: Vec<String> = projection
        .iter()
        .filter_map(|c| c.name.as_ref())
        .map(|n| n.to_ascii_lowercase())
        .collect();

    for column in &meta.columns {
        if !is_simple_identifier(&column.column_name) {
            report.errors.push(format!(
                "column_name '{}' is not a simple identifier",
                column.column_name
            ));
        }
        if let Some(alias) = &column.display_alias
            && alias.chars().count() > 15
        {
            report
                .warnings
                .push(format!("display_alias '{}' exceeds 15 characters", alias));
        }
    }

    for name in &projected {
        if !declared.contains(name) {
            report
                .errors
                .push(format!("SQL projects '{}' but metadata does not declare it", name));
        }
    }

    for name in &declared {
        if !projected.contains(name) {
            report
                .errors
                .push(format!("metadata declares '{}' but the SQL does not project it", name));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for name in &declared {
        if !seen.insert(name.clone()) {
            report.errors.push(format!("column '{}' is declared twice", name));
        }
    }

    if report.errors.is_empty() && declared != projected {
        report
            .warnings
            .push("declared column order differs from the SQL projection order".to_string());
    }

    report
}

/// Raising variant of [`validate`]
pub fn ensure_valid(meta: &QueryMetadata, dialect: Dialect) -> Result<(), MetadataError> {
    let report = validate(meta, dialect);
    if report.is_valid() {
        Ok(())
    } else {
        Err(MetadataError::Invalid { errors: report.errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    fn meta(sql: &str, columns: &[&str]) -> QueryMetadata {
        QueryMetadata {
            id: None,
            summary: "test".into(),
            description: "test".into(),
            sql: sql.into(),
            result_narrative: None,
            columns: columns.iter().map(|c| Column::named(*c)).collect(),
            parent_id: None,
            dialect: None,
        }
    }

    #[test]
    fn test_output_columns_bare_identifiers() {
        let cols = output_columns("SELECT user_id, user_name FROM users", Dialect::Trino).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name.as_deref(), Some("user_id"));
        assert_eq!(cols[1].name.as_deref(), Some("user_name"));
    }

    #[test]
    fn test_output_columns_prefers_alias() {
        let cols =
            output_columns("SELECT COUNT(*) AS total, t.name FROM t", Dialect::Trino).unwrap();
        assert_eq!(cols[0].name.as_deref(), Some("total"));
        assert_eq!(cols[1].name.as_deref(), Some("name"));
    }

    #[test]
    fn test_output_columns_wildcard_rejected() {
        let err = output_columns("SELECT * FROM users", Dialect::Trino).unwrap_err();
        assert!(matches!(err, MetadataError::Invalid { .. }));
    }

    #[test]
    fn test_output_columns_cte_uses_outer_projection() {
        let sql = "WITH t AS (SELECT a, b FROM x) SELECT a AS first_col FROM t";
        let cols = output_columns(sql, Dialect::Trino).unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name.as_deref(), Some("first_col"));
    }

    #[test]
    fn test_output_columns_union_uses_left_arm() {
        let sql = "SELECT a FROM x UNION ALL SELECT b FROM y";
        let cols = output_columns(sql, Dialect::Trino).unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name.as_deref(), Some("a"));
    }

    #[test]
    fn test_validate_happy_path() {
        let meta = meta("SELECT user_id, user_name FROM users", &["user_id", "user_name"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validate_case_insensitive() {
        let meta = meta("SELECT User_Id FROM users", &["USER_ID"]);
        assert!(validate(&meta, Dialect::Trino).is_valid());
    }

    #[test]
    fn test_validate_missing_declaration() {
        let meta = meta("SELECT user_id, user_name FROM users", &["user_id"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("user_name")));
    }

    #[test]
    fn test_validate_extraneous_declaration() {
        let meta = meta("SELECT user_id FROM users", &["user_id", "phantom"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("phantom")));
    }

    #[test]
    fn test_validate_non_simple_identifier() {
        let meta = meta("SELECT user_id FROM users", &["user_id"]);
        let mut bad = meta.clone();
        bad.columns[0].column_name = "u.user_id".into();
        let report = validate(&bad, Dialect::Trino);
        assert!(report.errors.iter().any(|e| e.contains("simple identifier")));
    }

    #[test]
    fn test_validate_unaliased_expression() {
        let meta = meta("SELECT COUNT(*) FROM users", &["cnt"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("AS alias")));
    }

    #[test]
    fn test_validate_order_mismatch_is_warning() {
        let meta = meta("SELECT a, b FROM t", &["b", "a"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_validate_duplicate_declaration() {
        let meta = meta("SELECT a FROM t", &["a", "a"]);
        let report = validate(&meta, Dialect::Trino);
        assert!(report.errors.iter().any(|e| e.contains("twice")));
    }

    #[test]
    fn test_ensure_valid_raises() {
        let bad = meta("SELECT a FROM t", &["b"]);
        let err = ensure_valid(&bad, Dialect::Trino).unwrap_err();
        let feedback = err.feedback_message();
        assert!(feedback.contains("columns"));
    }

    #[test]
    fn test_parse_error_reported() {
        let bad = meta("SELEKT a FROM", &["a"]);
        let report = validate(&bad, Dialect::Trino);
        assert!(report.errors.iter().any(|e| e.contains("parse failed")));
    }

    #[test]
    fn test_clickhouse_dialect_parses_backticks() {
        let meta = meta("SELECT `user_id` AS uid FROM users", &["uid"]);
        assert!(validate(&meta, Dialect::Clickhouse).is_valid());
    }
}
