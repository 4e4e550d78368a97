use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::value::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Overrides the configured statement timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One physical statement of a preview
#[derive(Debug, Clone, Serialize)]
pub struct PreviewUnit {
    pub sql: String,
    pub parameters: Vec<Value>,
    /// Logic table → actual table
    pub tables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub statement_kind: String,
    pub rule_version: u64,
    pub full_scan: bool,
    pub federated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federation_reason: Option<String>,
    /// Logic table → data nodes scanned by the federation engine
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub federation_nodes: BTreeMap<String, Vec<String>>,
    /// Data source → units executed there
    pub units: BTreeMap<String, Vec<PreviewUnit>>,
}

/// Result of one executed statement
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    pub execution_time_ms: u64,
    pub executed_at: DateTime<Utc>,
}

impl QueryResponse {
    pub fn rows(columns: Vec<String>, rows: Vec<Vec<Value>>, execution_time_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            columns: Some(columns),
            row_count: Some(rows.len()),
            rows: Some(rows),
            affected_rows: None,
            execution_time_ms,
            executed_at: Utc::now(),
        }
    }

    pub fn update(affected_rows: u64, execution_time_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            columns: None,
            rows: None,
            row_count: None,
            affected_rows: Some(affected_rows),
            execution_time_ms,
            executed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesResponse {
    pub version: u64,
    pub rules: super::rule::RuleConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert!(request.parameters.is_empty());
        assert!(request.timeout_secs.is_none());

        let request: QueryRequest =
            serde_json::from_str(r#"{"sql": "SELECT * FROM t WHERE a = ?", "parameters": [7]}"#).unwrap();
        assert_eq!(request.parameters, vec![Value::Int(7)]);
    }

    #[test]
    fn test_update_response_skips_rows() {
        let json = serde_json::to_value(QueryResponse::update(3, 12)).unwrap();
        assert_eq!(json["affected_rows"], 3);
        assert!(json["id"].as_str().is_some());
        assert!(json.get("rows").is_none());
    }
}
