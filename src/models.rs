use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of running the user's entry point against a single input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InputResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(message.into()),
        }
    }
}

/// Per-input results, in the order the inputs were submitted.
pub type InputResults = IndexMap<String, InputResult>;

/// Stored result of a finished execution.
///
/// Serialized untagged: a per-input mapping on completion, or a single
/// `{"error": ...}` object when the whole batch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Failed { error: String },
    Completed(InputResults),
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub inputs: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exec_id: Uuid,
    pub language: String,
    pub status: ExecutionStatus,
    pub result: Option<Outcome>,
    pub duration: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn pending(exec_id: Uuid, language: String) -> Self {
        Self {
            exec_id,
            language,
            status: ExecutionStatus::Pending,
            result: None,
            duration: None,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Combined view of an execution as seen by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionView {
    Unknown,
    Pending,
    Completed { outcome: Outcome, duration: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub code: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub exec_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub output: Outcome,
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResponse {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::{InputResult, Outcome};

    #[test]
    fn outcome_serializes_without_tag() {
        let failed = Outcome::Failed {
            error: "Unsupported language: cobol".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({ "error": "Unsupported language: cobol" })
        );

        let mut map = super::InputResults::new();
        map.insert("5".to_string(), InputResult::ok("25"));
        map.insert("x".to_string(), InputResult::fault("ValueError: bad input"));
        let value = serde_json::to_value(Outcome::Completed(map)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "5": { "output": "25" },
                "x": { "output": "", "error": "ValueError: bad input" }
            })
        );
    }

    #[test]
    fn completed_mapping_keeps_submission_order() {
        let mut map = super::InputResults::new();
        for input in ["10", "2", "b", "a"] {
            map.insert(input.to_string(), InputResult::ok(input));
        }
        let raw = serde_json::to_string(&Outcome::Completed(map)).unwrap();
        assert_eq!(
            raw,
            r#"{"10":{"output":"10"},"2":{"output":"2"},"b":{"output":"b"},"a":{"output":"a"}}"#
        );
    }

    #[test]
    fn input_named_error_is_not_mistaken_for_batch_failure() {
        let raw = serde_json::json!({ "error": { "output": "1" } });
        let outcome: Outcome = serde_json::from_value(raw).unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
    }
}
