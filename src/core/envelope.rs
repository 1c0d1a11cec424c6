//! Producer output envelope.
//!
//! The only interface producers use:
//!
//! ```json
//! {
//!   "activity_event": {"action": "complete", "task_id": "T-1010", "verification": {"checks": ["unit"]}},
//!   "file_updates": [{"path": "src/T-1010.txt", "content": "..."}]
//! }
//! ```
//!
//! The validator inspects raw JSON so that malformed input can be reported
//! precisely; these types describe the accepted shape and generate
//! `.roadmap/agent_result.schema.json`.

use crate::core::events::{LessonDraft, ReviewDecision, Verification};
use crate::core::state::Severity;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root keys an envelope may carry.
pub const ROOT_KEYS: [&str; 2] = ["activity_event", "file_updates"];

/// A complete producer reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProducerOutput {
    pub activity_event: ActivityEvent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_updates: Vec<FileUpdate>,
}

/// The proposed lifecycle action. Only `action` and `task_id` are always
/// required; the rest depends on the action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActivityEvent {
    pub action: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_patch: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_verification: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson: Option<LessonDraft>,
}

impl ActivityEvent {
    #[must_use]
    pub fn new(action: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            task_id: task_id.into(),
            ..Self::default()
        }
    }
}

/// Full replacement content for one workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
}

impl ProducerOutput {
    #[must_use]
    pub const fn new(activity_event: ActivityEvent) -> Self {
        Self {
            activity_event,
            file_updates: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.file_updates.push(FileUpdate {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// JSON Schema of the producer envelope.
pub fn agent_result_schema() -> serde_json::Result<Value> {
    serde_json::to_value(schema_for!(ProducerOutput))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_serializes_without_empty_fields() {
        let output = ProducerOutput::new(ActivityEvent::new("claim", "T-1"));
        assert_eq!(
            output.to_json().unwrap(),
            r#"{"activity_event":{"action":"claim","task_id":"T-1"}}"#
        );
    }

    #[test]
    fn schema_names_required_fields() {
        let schema = agent_result_schema().unwrap();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "activity_event"));

        let event = &schema["definitions"]["ActivityEvent"];
        let required: Vec<_> = event["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(required, vec!["action", "task_id"]);
    }
}
