//! Entities derived from events.
//!
//! Nothing in this module is ever written directly: every value is produced
//! by [`crate::core::projection`] replaying the event log.

use crate::core::events::{Escalation, TaskOutputs, TaskSpec, Verification};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    /// Terminal. A done task is frozen; corrections go through a hotfix task.
    Done,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task represents. Boundaries are configured per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Spec,
    Impl,
    Qa,
    Other(String),
}

impl TaskKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Spec => "spec",
            Self::Impl => "impl",
            Self::Qa => "qa",
            Self::Other(kind) => kind,
        }
    }

    /// Implementation-kind tasks must carry verification checks to complete.
    #[must_use]
    pub const fn requires_verification(&self) -> bool {
        matches!(self, Self::Impl)
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "spec" => Self::Spec,
            "impl" => Self::Impl,
            "qa" => Self::Qa,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Resolved,
}

/// Status of the current run as recorded by `run.*` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Initialized,
    Running,
    Success,
    Failed,
    Halted,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Halted => "halted",
        }
    }
}

/// Externally visible verification outcome. The last `verify.*` event wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    #[default]
    Unknown,
    Ok,
    /// Older logs recorded `fail` for what is now `mismatch`.
    #[serde(alias = "fail")]
    Mismatch,
    Corrupted,
}

impl VerifyStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ok => "ok",
            Self::Mismatch => "mismatch",
            Self::Corrupted => "corrupted",
        }
    }
}

impl std::fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Immutability {
    pub done_is_immutable: bool,
}

impl Default for Immutability {
    fn default() -> Self {
        Self {
            done_is_immutable: true,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_kind: TaskKind,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub outputs: TaskOutputs,
    #[serde(default)]
    pub immutability: Immutability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_hotfix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
    /// Path prefixes a hotfix may write, narrower than the kind boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_patch: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_verification: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    /// Rejected or timed-out attempts since the last escalation reset.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
    /// Open issue that blocks this task from being dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

impl Task {
    /// Builds a fresh `todo` task from a creation payload.
    ///
    /// A blank description falls back to the title.
    #[must_use]
    pub fn from_spec(spec: &TaskSpec) -> Self {
        let description = spec
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&spec.title)
            .to_string();
        let hotfix = spec.is_hotfix;
        Self {
            task_id: spec.task_id.clone(),
            task_kind: spec.task_kind.clone(),
            title: spec.title.clone(),
            description,
            status: TaskStatus::Todo,
            depends_on: spec.depends_on.clone(),
            targets: spec.targets.clone(),
            outputs: spec.outputs.clone(),
            immutability: Immutability::default(),
            assigned_to: None,
            started_at: None,
            completed_at: None,
            verification: None,
            is_hotfix: hotfix,
            issue_id: spec.issue_id.clone().filter(|_| hotfix),
            fixes: spec.fixes.clone().filter(|_| hotfix),
            scope_patch: spec.scope_patch.clone().filter(|_| hotfix),
            required_verification: spec.required_verification.clone().filter(|_| hotfix),
            baseline_id: spec.baseline_id.clone().filter(|_| hotfix),
            attempts: 0,
            blocked_by: None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Minimum number of verification checks a `complete` must carry.
    #[must_use]
    pub fn min_verification_checks(&self) -> usize {
        if self.is_hotfix {
            2
        } else if self.task_kind.requires_verification() {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLinks {
    pub reported_by_task_id: Option<String>,
    pub fixes_task_id: Option<String>,
    pub hotfix_task_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTimeline {
    pub created_event_seq: u64,
    pub resolved_event_seq: Option<u64>,
}

/// A reported defect or risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub status: IssueStatus,
    pub severity: Severity,
    pub title: String,
    pub baseline_id: Option<String>,
    pub affected: Value,
    pub evidence: Value,
    pub resolution: Option<Value>,
    pub links: IssueLinks,
    pub timeline: IssueTimeline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
}

impl Issue {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct LessonScope {
    #[serde(default)]
    pub task_kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct LessonEnforcement {
    pub applies_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub task_id: Option<String>,
    pub event_id: String,
}

/// A process rule learned from a reported mistake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub lesson_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub mistake: String,
    pub rule: String,
    pub scope: LessonScope,
    pub enforcement: LessonEnforcement,
    pub source_refs: Vec<SourceRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_round_trips_unknown_kinds() {
        let kind: TaskKind = serde_json::from_str("\"docs\"").unwrap();
        assert_eq!(kind, TaskKind::Other("docs".to_string()));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"docs\"");
        assert_eq!(TaskKind::from("impl"), TaskKind::Impl);
    }

    #[test]
    fn legacy_fail_reads_as_mismatch() {
        let status: VerifyStatus = serde_json::from_str("\"fail\"").unwrap();
        assert_eq!(status, VerifyStatus::Mismatch);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"mismatch\"");
    }

    #[test]
    fn blank_description_falls_back_to_title() {
        let spec = TaskSpec::new("T-1", TaskKind::Spec, "Write the spec").with_description("  ");
        let task = Task::from_spec(&spec);
        assert_eq!(task.description, "Write the spec");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.min_verification_checks(), 0);
    }

    #[test]
    fn hotfix_fields_only_stick_to_hotfix_tasks() {
        let mut spec = TaskSpec::new("T-2", TaskKind::Impl, "Build");
        spec.issue_id = Some("ISS-1".to_string());
        assert_eq!(Task::from_spec(&spec).issue_id, None);

        spec.is_hotfix = true;
        let hotfix = Task::from_spec(&spec);
        assert_eq!(hotfix.issue_id.as_deref(), Some("ISS-1"));
        assert_eq!(hotfix.min_verification_checks(), 2);
    }

    #[test]
    fn task_status_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
