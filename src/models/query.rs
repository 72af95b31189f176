use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// One result column as declared by the model.
///
/// `column_name` must be the projection name the SQL actually produces: the
/// alias when `AS` is used, the bare identifier otherwise. Never an
/// expression, never table-prefixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Column {
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Short display alias, kept to roughly 15 characters by the prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub column_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            summary: None,
            display_alias: None,
            column_type: None,
            description: None,
        }
    }
}

/// The structured output the model produces for one request, and the shape
/// persisted alongside it. `id`, `parent_id` and `dialect` are assigned at
/// persist time; the model never emits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Four-or-so word headline
    pub summary: String,
    /// One paragraph describing what the query answers
    pub description: String,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_narrative: Option<String>,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
}

impl QueryMetadata {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column_name.as_str()).collect()
    }

    /// Case-insensitive membership check used for sort_by validation
    pub fn has_column(&self, name: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.column_name.eq_ignore_ascii_case(name))
    }
}

/// Persisted query row; columns are stored as JSON
#[derive(Debug, Clone, FromRow)]
pub struct QueryRecord {
    pub id: String,
    pub session_id: String,
    pub request_id: String,
    pub parent_id: Option<String>,
    pub summary: String,
    pub description: String,
    pub sql_text: String,
    pub result_narrative: Option<String>,
    pub columns_json: String,
    pub dialect: String,
    pub created_at: DateTime<Utc>,
}

impl QueryRecord {
    pub fn into_metadata(self) -> Result<QueryMetadata, serde_json::Error> {
        let columns: Vec<Column> = serde_json::from_str(&self.columns_json)?;
        Ok(QueryMetadata {
            id: Some(self.id),
            summary: self.summary,
            description: self.description,
            sql: self.sql_text,
            result_narrative: self.result_narrative,
            columns,
            parent_id: self.parent_id,
            dialect: Some(self.dialect),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryMetadata {
        QueryMetadata {
            id: None,
            summary: "Users by signup".into(),
            description: "Counts users grouped by signup month.".into(),
            sql: "SELECT month, COUNT(*) AS user_count FROM users GROUP BY month".into(),
            result_narrative: None,
            columns: vec![Column::named("month"), Column::named("user_count")],
            parent_id: None,
            dialect: None,
        }
    }

    #[test]
    fn test_serde_fixed_point() {
        let meta = sample();
        let first = serde_json::to_string(&meta).unwrap();
        let back: QueryMetadata = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&back).unwrap();
        assert_eq!(first, second);
        assert_eq!(meta, back);
    }

    #[test]
    fn test_llm_output_without_optional_fields_parses() {
        let raw = r#"{
            "summary": "Top users",
            "description": "Lists users.",
            "sql": "SELECT user_id FROM users",
            "columns": [{"column_name": "user_id"}]
        }"#;
        let meta: QueryMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.columns.len(), 1);
        assert!(meta.id.is_none());
    }

    #[test]
    fn test_has_column_case_insensitive() {
        let meta = sample();
        assert!(meta.has_column("USER_COUNT"));
        assert!(meta.has_column("month"));
        assert!(!meta.has_column("missing"));
    }

    #[test]
    fn test_record_round_trip() {
        let record = QueryRecord {
            id: "q1".into(),
            session_id: "s1".into(),
            request_id: "r1".into(),
            parent_id: Some("q0".into()),
            summary: "x".into(),
            description: "y".into(),
            sql_text: "SELECT 1 AS one".into(),
            result_narrative: None,
            columns_json: r#"[{"column_name":"one"}]"#.into(),
            dialect: "clickhouse".into(),
            created_at: Utc::now(),
        };
        let meta = record.into_metadata().unwrap();
        assert_eq!(meta.parent_id.as_deref(), Some("q0"));
        assert_eq!(meta.dialect.as_deref(), Some("clickhouse"));
        assert_eq!(meta.columns[0].column_name, "one");
    }
}
