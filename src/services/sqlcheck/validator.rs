//! SQL validator: runs the warehouse's plan-generation path (`EXPLAIN`)
//! without materializing results and turns driver failures into structured,
//! classified diagnostics the repair loop can feed back to the model.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::Duration;

use crate::services::cache::CacheHandle;
use crate::services::dialect::Dialect;
use crate::services::sqlcheck::metadata::parser_dialect;
use crate::services::warehouse::{WarehouseFailure, WarehousePool};
use crate::utils::error::{ApiError, ApiResult};
use crate::utils::sql_hash;

/// Classification of a warehouse rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Syntax,
    UnknownIdentifier,
    TypeMismatch,
    Timeout,
    Permission,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlErrorInfo {
    pub class: ErrorClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// Outcome of `explain_analyze`. Serialized verbatim into the validation
/// cache, so two calls within the TTL return identical payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SqlErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair_guidance: Option<String>,
}

impl SqlValidation {
    /// Diagnostic text appended to the model conversation on failure
    pub fn feedback_message(&self) -> String {
        let Some(error) = &self.error else {
            return String::new();
        };
        let mut message = format!(
            "The warehouse rejected the SQL ({:?}): {}",
            error.class, error.message
        );
        if let Some(pos) = error.position {
            message.push_str(&format!(" (near position {})", pos));
        }
        if let Some(guidance) = &self.repair_guidance {
            message.push_str("\nGuidance: ");
            message.push_str(guidance);
        }
        message.push_str("\nProduce a corrected query and the full metadata object.");
        message
    }
}

struct GuidancePattern {
    pattern: Regex,
    guidance: &'static str,
}

/// Curated registry of error patterns with constraint statements and an
/// alternative approach. Advisory only; the model may choose another path.
static GUIDANCE_REGISTRY: Lazy<Vec<GuidancePattern>> = Lazy::new(|| {
    let entry = |pattern: &str, guidance: &'static str| GuidancePattern {
        pattern: Regex::new(&format!("(?i){}", pattern)).expect("static regex"),
        guidance,
    };
    vec![
        entry(
            r"(function\s+)?LAG.{0,40}(does not exist|not (found|supported)|unknown)",
            "Window function LAG is not available on this engine. Restructure with \
             groupArray over an ordered subquery and arrayJoin, or self-join on the \
             previous period.",
        ),
        entry(
            r"(function\s+)?LEAD.{0,40}(does not exist|not (found|supported)|unknown)",
            "Window function LEAD is not available on this engine. Use groupArray + \
             arrayJoin over an ordered subquery, or a self-join shifted by one row.",
        ),
        entry(
            r"cannot be resolved from subquery|correlated subquery",
            "Correlated subqueries are limited here. Rewrite as an explicit JOIN \
             against a pre-aggregated derived table.",
        ),
        entry(
            r"recursive CTE|WITH RECURSIVE",
            "Recursive CTEs are not supported on this engine. Bound the recursion \
             manually with a fixed number of self-joins.",
        ),
        entry(
            r"Division by zero",
            "Guard divisions with NULLIF(denominator, 0) so empty groups do not fail.",
        ),
        entry(
            r"Memory limit .*exceeded|exceeds memory",
            "The query exceeds the memory budget. Aggregate before joining and \
             restrict the scanned date range.",
        ),
    ]
});

fn repair_guidance_for(message: &str) -> Option<String> {
    GUIDANCE_REGISTRY
        .iter()
        .find(|entry| entry.pattern.is_match(message))
        .map(|entry| entry.guidance.to_string())
}

static POSITION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:position|line)[:\s]+(\d+)").expect("static regex"));

/// Classify a driver error message (and MySQL-protocol error code when
/// available).
pub fn classify_error(message: &str, code: Option<u16>) -> ErrorClass {
    match code {
        Some(1064) => return ErrorClass::Syntax,
        Some(1054) | Some(1146) => return ErrorClass::UnknownIdentifier,
        Some(1045) | Some(1142) | Some(1143) => return ErrorClass::Permission,
        _ => {},
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("syntax error") || lower.contains("parse error") {
        ErrorClass::Syntax
    } else if lower.contains("unknown column")
        || lower.contains("unknown identifier")
        || lower.contains("unknown table")
        || lower.contains("unknown function")
        || lower.contains("cannot be resolved")
        || lower.contains("does not exist")
        || lower.contains("not found")
    {
        ErrorClass::UnknownIdentifier
    } else if lower.contains("type mismatch")
        || lower.contains("cannot convert")
        || lower.contains("illegal type")
        || lower.contains("no operator matches")
        || lower.contains("incompatible type")
    {
        ErrorClass::TypeMismatch
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorClass::Timeout
    } else if lower.contains("access denied")
        || lower.contains("permission")
        || lower.contains("not authorized")
    {
        ErrorClass::Permission
    } else {
        ErrorClass::Other
    }
}

fn error_position(message: &str) -> Option<u32> {
    POSITION_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Validates SQL against the warehouse, caching results by SQL hash to absorb
/// repair-loop bursts (ok ≈ 10 min, errors ≈ 1 min).
pub struct SqlValidator {
    warehouses: Arc<WarehousePool>,
    cache: CacheHandle,
    ok_ttl: Duration,
    err_ttl: Duration,
}

impl SqlValidator {
    pub fn new(
        warehouses: Arc<WarehousePool>,
        cache: CacheHandle,
        ok_ttl: Duration,
        err_ttl: Duration,
    ) -> Self {
        Self { warehouses, cache, ok_ttl, err_ttl }
    }

    /// Validate `sql` on `profile`. Parser failures are non-blocking warnings;
    /// the warehouse's judgment is authoritative. Connection failures escape
    /// as [`ApiError`] since retrying the model cannot fix them.
    pub async fn explain_analyze(&self, sql: &str, profile: &str) -> ApiResult<SqlValidation> {
        let cache_key = CacheHandle::key("validate", &[profile, &sql_hash(sql)]);
        if let Some(cached) = self.cache.get(&cache_key).await
            && let Ok(validation) = serde_json::from_str::<SqlValidation>(&cached)
        {
            tracing::debug!("Validation cache hit for profile '{}'", profile);
            return Ok(validation);
        }

        let warehouse = self.warehouses.get(profile)?;
        let dialect = warehouse.dialect();

        let mut warnings = Vec::new();
        if let Err(parse_err) = Parser::parse_sql(&*parser_dialect(dialect), sql) {
            warnings.push(format!("parser warning: {}", parse_err));
        }

        let validation = match warehouse.explain(sql, false).await {
            Ok(plan) => SqlValidation {
                valid: true,
                plan: Some(plan),
                error: None,
                warnings,
                repair_guidance: None,
            },
            Err(WarehouseFailure::Connection(message)) => {
                return Err(ApiError::WarehouseConnectionFailed(message));
            },
            Err(WarehouseFailure::Timeout(after)) => SqlValidation {
                valid: false,
                plan: None,
                error: Some(SqlErrorInfo {
                    class: ErrorClass::Timeout,
                    message: format!("EXPLAIN timed out after {:?}", after),
                    position: None,
                }),
                warnings,
                repair_guidance: Some(
                    "The query is too expensive to even plan. Reduce the number of \
                     joined tables and add selective filters."
                        .to_string(),
                ),
            },
            Err(WarehouseFailure::Query { message, code }) => {
                let class = classify_error(&message, code);
                let repair_guidance = repair_guidance_for(&message);
                SqlValidation {
                    valid: false,
                    plan: None,
                    error: Some(SqlErrorInfo {
                        class,
                        position: error_position(&message),
                        message,
                    }),
                    warnings,
                    repair_guidance,
                }
            },
        };

        let ttl = if validation.valid { self.ok_ttl } else { self.err_ttl };
        if let Ok(serialized) = serde_json::to_string(&validation) {
            self.cache.set(&cache_key, &serialized, ttl).await;
        }

        Ok(validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_code() {
        assert_eq!(classify_error("anything", Some(1064)), ErrorClass::Syntax);
        assert_eq!(classify_error("anything", Some(1054)), ErrorClass::UnknownIdentifier);
        assert_eq!(classify_error("anything", Some(1142)), ErrorClass::Permission);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(classify_error("Syntax error at line 3", None), ErrorClass::Syntax);
        assert_eq!(
            classify_error("Unknown column 'usr_id' in table", None),
            ErrorClass::UnknownIdentifier
        );
        assert_eq!(
            classify_error("Cannot convert String to UInt64", None),
            ErrorClass::TypeMismatch
        );
        assert_eq!(classify_error("Query timed out", None), ErrorClass::Timeout);
        assert_eq!(classify_error("Access denied for user", None), ErrorClass::Permission);
        assert_eq!(classify_error("something exotic", None), ErrorClass::Other);
    }

    #[test]
    fn test_error_position_extraction() {
        assert_eq!(error_position("Syntax error at position 42"), Some(42));
        assert_eq!(error_position("error at line 3 near SELECT"), Some(3));
        assert_eq!(error_position("no location here"), None);
    }

    #[test]
    fn test_repair_guidance_lag() {
        let guidance =
            repair_guidance_for("Function LAG does not exist on ClickHouse cluster").unwrap();
        assert!(guidance.contains("groupArray"));
    }

    #[test]
    fn test_repair_guidance_correlated_subquery() {
        let guidance =
            repair_guidance_for("Column x cannot be resolved from subquery scope").unwrap();
        assert!(guidance.contains("JOIN"));
    }

    #[test]
    fn test_repair_guidance_unmatched() {
        assert!(repair_guidance_for("totally novel failure").is_none());
    }

    #[test]
    fn test_feedback_message_includes_guidance() {
        let validation = SqlValidation {
            valid: false,
            plan: None,
            error: Some(SqlErrorInfo {
                class: ErrorClass::UnknownIdentifier,
                message: "Function LAG does not exist".into(),
                position: Some(10),
            }),
            warnings: vec![],
            repair_guidance: Some("do not use LAG".into()),
        };
        let feedback = validation.feedback_message();
        assert!(feedback.contains("LAG does not exist"));
        assert!(feedback.contains("position 10"));
        assert!(feedback.contains("do not use LAG"));
    }

    #[test]
    fn test_validation_serde_round_trip() {
        let validation = SqlValidation {
            valid: true,
            plan: Some(vec!["Scan users".into()]),
            error: None,
            warnings: vec!["parser warning: x".into()],
            repair_guidance: None,
        };
        let json = serde_json::to_string(&validation).unwrap();
        let back: SqlValidation = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }
}
