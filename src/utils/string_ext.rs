//! String helpers shared across services

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Clean an optional string field: trim whitespace, drop empties
#[inline]
pub fn clean_optional_string(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Stable hex hash of arbitrary content, used for cache keys and lineage
/// records. Not cryptographic.
pub fn content_hash(content: &str) -> String {
    let mut h = DefaultHasher::new();
    content.hash(&mut h);
    format!("{:016x}", h.finish())
}

/// Hash of SQL text with whitespace runs collapsed, so reformatting does not
/// bust the validation cache.
pub fn sql_hash(sql: &str) -> String {
    content_hash(&sql.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// A simple identifier: starts with a letter or underscore, continues with
/// alphanumerics/underscores. No dots, no quotes, no whitespace, no calls.
pub fn is_simple_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_optional_string() {
        assert_eq!(clean_optional_string(Some(&"  x ".to_string())), Some("x".to_string()));
        assert_eq!(clean_optional_string(Some(&"   ".to_string())), None);
        assert_eq!(clean_optional_string(None), None);
    }

    #[test]
    fn test_sql_hash_ignores_whitespace() {
        assert_eq!(sql_hash("SELECT  1\nFROM t"), sql_hash("SELECT 1 FROM t"));
        assert_ne!(sql_hash("SELECT 1 FROM t"), sql_hash("SELECT 2 FROM t"));
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_eq!(content_hash("abc").len(), 16);
    }

    #[test]
    fn test_is_simple_identifier() {
        assert!(is_simple_identifier("user_id"));
        assert!(is_simple_identifier("_private"));
        assert!(is_simple_identifier("col2"));
        assert!(!is_simple_identifier(""));
        assert!(!is_simple_identifier("2col"));
        assert!(!is_simple_identifier("t.col"));
        assert!(!is_simple_identifier("count(*)"));
        assert!(!is_simple_identifier("a b"));
        assert!(!is_simple_identifier("\"quoted\""));
    }
}
