//! Human-authored schema descriptors: per-profile YAML mapping fully
//! qualified table names to descriptions, key concepts, and use cases.
//! Merged with live introspection to produce the prompt-ready schema block.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::services::vector::QueryExample;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaDescriptor {
    /// Fully qualified table name → annotations
    pub tables: HashMap<String, TableDescriptor>,
    /// Curated (natural language, SQL) example pairs for the example index
    pub examples: Vec<QueryExample>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDescriptor {
    pub description: Option<String>,
    pub key_concepts: Vec<String>,
    pub use_cases: Vec<String>,
    /// Column name → description
    pub columns: HashMap<String, String>,
}

impl SchemaDescriptor {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read descriptor {}: {}", path.display(), e))?;
        let descriptor: SchemaDescriptor = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("bad descriptor {}: {}", path.display(), e))?;
        Ok(descriptor)
    }

    pub fn table(&self, qualified_name: &str) -> Option<&TableDescriptor> {
        self.tables.get(qualified_name)
    }

    pub fn column_description(&self, qualified_name: &str, column: &str) -> Option<&str> {
        self.table(qualified_name)
            .and_then(|t| t.columns.get(column))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_parsing() {
        let yaml = r#"
tables:
  sales.orders:
    description: Customer orders ledger
    key_concepts: [order lifecycle, revenue]
    use_cases:
      - revenue by period
    columns:
      order_id: Order identifier
      amount: Gross order amount
examples:
  - description: total revenue by month
    sql: SELECT month, SUM(amount) AS revenue FROM sales.orders GROUP BY month
    tables: [sales.orders]
"#;
        let descriptor: SchemaDescriptor = serde_yaml::from_str(yaml).unwrap();
        let table = descriptor.table("sales.orders").unwrap();
        assert_eq!(table.description.as_deref(), Some("Customer orders ledger"));
        assert_eq!(table.key_concepts.len(), 2);
        assert_eq!(
            descriptor.column_description("sales.orders", "amount"),
            Some("Gross order amount")
        );
        assert_eq!(descriptor.examples.len(), 1);
    }

    #[test]
    fn test_empty_descriptor_is_valid() {
        let descriptor: SchemaDescriptor = serde_yaml::from_str("{}").unwrap();
        assert!(descriptor.tables.is_empty());
        assert!(descriptor.table("anything").is_none());
    }
}
