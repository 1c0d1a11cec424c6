//! Event definitions and types.
//!
//! All state is derived from events. Events are immutable, append-only, and
//! ordered by `event_seq` alone; `ts` is informational.
//!
//! On the wire an event is one JSON record:
//!
//! ```text
//! {"schema_version","event_id","event_seq","ts","actor","action","payload"}
//! ```
//!
//! In memory the `action`/`payload` pair is a closed tagged union
//! ([`EventBody`]), so every consumer matches the vocabulary exhaustively.

use crate::core::policy::EscalationAction;
use crate::core::state::{
    LessonEnforcement, LessonScope, RunStatus, Severity, TaskKind, TaskStatus, VerifyStatus,
};
use crate::core::validator::RejectReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Schema version stamped on every event written by this engine.
pub const SCHEMA_VERSION: &str = "0.4.0";
/// Engine compatibility line reported in view metadata.
pub const ENGINE_VERSION: &str = "0.4.x";
/// The only actor allowed to append to the store.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Canonical action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    RunStart,
    RunEnd,
    TaskCreate,
    HotfixCreate,
    Claim,
    Complete,
    Review,
    IssueReport,
    IssueResolve,
    OutputRejected,
    FileWrite,
    ViewMutate,
    VerifyStart,
    VerifyOk,
    VerifyFail,
}

impl Action {
    pub const ALL: [Self; 15] = [
        Self::RunStart,
        Self::RunEnd,
        Self::TaskCreate,
        Self::HotfixCreate,
        Self::Claim,
        Self::Complete,
        Self::Review,
        Self::IssueReport,
        Self::IssueResolve,
        Self::OutputRejected,
        Self::FileWrite,
        Self::ViewMutate,
        Self::VerifyStart,
        Self::VerifyOk,
        Self::VerifyFail,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStart => "run.start",
            Self::RunEnd => "run.end",
            Self::TaskCreate => "task.create",
            Self::HotfixCreate => "hotfix.create",
            Self::Claim => "claim",
            Self::Complete => "complete",
            Self::Review => "review",
            Self::IssueReport => "issue.report",
            Self::IssueResolve => "issue.resolve",
            Self::OutputRejected => "output.rejected",
            Self::FileWrite => "orchestrator.file.write",
            Self::ViewMutate => "orchestrator.view.mutate",
            Self::VerifyStart => "verify.start",
            Self::VerifyOk => "verify.ok",
            Self::VerifyFail => "verify.fail",
        }
    }

    /// Looks up an action by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == name)
    }

    /// Actions a producer may propose. Everything else is orchestrator-reserved.
    #[must_use]
    pub const fn is_producer_action(self) -> bool {
        matches!(
            self,
            Self::Claim | Self::Complete | Self::Review | Self::IssueReport
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zero-padded, sequence-derived event identifier (`EV-00000042`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    #[must_use]
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("EV-{seq:08}"))
    }

    /// Identifier assigned to legacy records that were written without one.
    #[must_use]
    pub fn legacy(seq: u64) -> Self {
        Self(format!("LEGACY-EV-{seq:08}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(serde_json::Map::is_empty)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputs {
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Verification {
    #[serde(default)]
    pub checks: Vec<String>,
}

/// Orchestrator-recorded escalation decision attached to an `issue.report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub action: EscalationAction,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStartPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEndPayload {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of `task.create` and `hotfix.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub task_kind: TaskKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub outputs: TaskOutputs,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_hotfix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_patch: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_verification: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
}

impl TaskSpec {
    #[must_use]
    pub fn new(task_id: impl Into<String>, task_kind: TaskKind, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_kind,
            title: title.into(),
            description: None,
            depends_on: Vec::new(),
            targets: Vec::new(),
            outputs: TaskOutputs::default(),
            is_hotfix: false,
            issue_id: None,
            fixes: None,
            scope_patch: None,
            required_verification: None,
            baseline_id: None,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.outputs.files.push(path.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub task_id: String,
    pub decision: ReviewDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Lesson attached to a process `issue.report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct LessonDraft {
    pub mistake: String,
    pub rule: String,
    #[serde(default)]
    pub scope: LessonScope,
    pub enforcement: LessonEnforcement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueReportPayload {
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub affected: Value,
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub evidence: Value,
    /// Done task this issue is about; triggers a hotfix task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
}

impl IssueReportPayload {
    #[must_use]
    pub fn baseline_id(&self) -> Option<String> {
        self.affected
            .get("baseline_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    #[must_use]
    pub fn is_lesson(&self) -> bool {
        self.category.as_deref() == Some("process")
            && self.subtype.as_deref() == Some("lesson")
            && self.lesson.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueResolvePayload {
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRejectedPayload {
    #[serde(default)]
    pub task_id: Option<String>,
    pub reason: RejectReason,
    pub message: String,
    #[serde(default = "unknown_action_name")]
    pub source_action: String,
    /// Attempt number this rejection consumed (1-based).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
}

fn unknown_action_name() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWritePayload {
    pub task_id: String,
    pub path: String,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMutatePayload {
    pub task_id: String,
    pub source_action: String,
    #[serde(default)]
    pub from: Option<TaskStatus>,
    #[serde(default)]
    pub to: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyStartPayload {
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOkPayload {
    pub projection_hash_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyFailPayload {
    #[serde(default = "default_fail_status")]
    pub verify_status: VerifyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_hash_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_projection_hash_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

const fn default_fail_status() -> VerifyStatus {
    VerifyStatus::Mismatch
}

/// Action-specific body of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    RunStart(RunStartPayload),
    RunEnd(RunEndPayload),
    TaskCreate(TaskSpec),
    HotfixCreate(TaskSpec),
    Claim(ClaimPayload),
    Complete(CompletePayload),
    Review(ReviewPayload),
    IssueReport(IssueReportPayload),
    IssueResolve(IssueResolvePayload),
    OutputRejected(OutputRejectedPayload),
    FileWrite(FileWritePayload),
    ViewMutate(ViewMutatePayload),
    VerifyStart(VerifyStartPayload),
    VerifyOk(VerifyOkPayload),
    VerifyFail(VerifyFailPayload),
    /// A record whose action is outside the vocabulary (historical drift).
    /// Kept so the log stays readable; projection ignores it.
    Unrecognized { action: String, payload: Value },
}

impl EventBody {
    /// Decodes a wire `action` + `payload` pair.
    pub fn decode(action: &str, payload: Value) -> serde_json::Result<Self> {
        use serde_json::from_value;

        let Some(known) = Action::parse(action) else {
            return Ok(Self::Unrecognized {
                action: action.to_string(),
                payload,
            });
        };
        Ok(match known {
            Action::RunStart => Self::RunStart(from_value(payload)?),
            Action::RunEnd => Self::RunEnd(from_value(payload)?),
            Action::TaskCreate => Self::TaskCreate(from_value(payload)?),
            Action::HotfixCreate => Self::HotfixCreate(from_value(payload)?),
            Action::Claim => Self::Claim(from_value(payload)?),
            Action::Complete => Self::Complete(from_value(payload)?),
            Action::Review => Self::Review(from_value(payload)?),
            Action::IssueReport => Self::IssueReport(from_value(payload)?),
            Action::IssueResolve => Self::IssueResolve(from_value(payload)?),
            Action::OutputRejected => Self::OutputRejected(from_value(payload)?),
            Action::FileWrite => Self::FileWrite(from_value(payload)?),
            Action::ViewMutate => Self::ViewMutate(from_value(payload)?),
            Action::VerifyStart => Self::VerifyStart(from_value(payload)?),
            Action::VerifyOk => Self::VerifyOk(from_value(payload)?),
            Action::VerifyFail => Self::VerifyFail(from_value(payload)?),
        })
    }

    /// The vocabulary entry, or `None` for unrecognized records.
    #[must_use]
    pub const fn action(&self) -> Option<Action> {
        Some(match self {
            Self::RunStart(_) => Action::RunStart,
            Self::RunEnd(_) => Action::RunEnd,
            Self::TaskCreate(_) => Action::TaskCreate,
            Self::HotfixCreate(_) => Action::HotfixCreate,
            Self::Claim(_) => Action::Claim,
            Self::Complete(_) => Action::Complete,
            Self::Review(_) => Action::Review,
            Self::IssueReport(_) => Action::IssueReport,
            Self::IssueResolve(_) => Action::IssueResolve,
            Self::OutputRejected(_) => Action::OutputRejected,
            Self::FileWrite(_) => Action::FileWrite,
            Self::ViewMutate(_) => Action::ViewMutate,
            Self::VerifyStart(_) => Action::VerifyStart,
            Self::VerifyOk(_) => Action::VerifyOk,
            Self::VerifyFail(_) => Action::VerifyFail,
            Self::Unrecognized { .. } => return None,
        })
    }

    #[must_use]
    pub fn action_name(&self) -> &str {
        match self {
            Self::Unrecognized { action, .. } => action,
            other => other.action().map_or("unknown", Action::as_str),
        }
    }

    /// Task the event targets, when it has one.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreate(spec) | Self::HotfixCreate(spec) => Some(&spec.task_id),
            Self::Claim(p) => Some(&p.task_id),
            Self::Complete(p) => Some(&p.task_id),
            Self::Review(p) => Some(&p.task_id),
            Self::IssueReport(p) => p.task_id.as_deref(),
            Self::OutputRejected(p) => p.task_id.as_deref(),
            Self::FileWrite(p) => Some(&p.task_id),
            Self::ViewMutate(p) => Some(&p.task_id),
            _ => None,
        }
    }

    /// Encodes the payload half of the wire pair.
    pub fn payload(&self) -> serde_json::Result<Value> {
        use serde_json::to_value;

        match self {
            Self::RunStart(p) => to_value(p),
            Self::RunEnd(p) => to_value(p),
            Self::TaskCreate(p) | Self::HotfixCreate(p) => to_value(p),
            Self::Claim(p) => to_value(p),
            Self::Complete(p) => to_value(p),
            Self::Review(p) => to_value(p),
            Self::IssueReport(p) => to_value(p),
            Self::IssueResolve(p) => to_value(p),
            Self::OutputRejected(p) => to_value(p),
            Self::FileWrite(p) => to_value(p),
            Self::ViewMutate(p) => to_value(p),
            Self::VerifyStart(p) => to_value(p),
            Self::VerifyOk(p) => to_value(p),
            Self::VerifyFail(p) => to_value(p),
            Self::Unrecognized { payload, .. } => Ok(payload.clone()),
        }
    }
}

/// Wire shape of an event record. Every field is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: String,
    pub event_id: String,
    pub event_seq: u64,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub payload: Value,
}

/// Required envelope fields, in wire order.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "schema_version",
    "event_id",
    "event_seq",
    "ts",
    "actor",
    "action",
    "payload",
];

/// An immutable fact in the log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "EventRecord")]
pub struct Event {
    pub schema_version: String,
    pub event_id: EventId,
    pub event_seq: u64,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub body: EventBody,
}

impl Event {
    /// Creates an event with a sequence-derived id.
    #[must_use]
    pub fn new(event_seq: u64, actor: impl Into<String>, ts: DateTime<Utc>, body: EventBody) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: EventId::from_seq(event_seq),
            event_seq,
            ts,
            actor: actor.into(),
            body,
        }
    }

    #[must_use]
    pub fn action_name(&self) -> &str {
        self.body.action_name()
    }

    #[must_use]
    pub fn is_from_orchestrator(&self) -> bool {
        self.actor == ORCHESTRATOR
    }

    /// Converts into the wire record.
    pub fn to_record(&self) -> serde_json::Result<EventRecord> {
        Ok(EventRecord {
            schema_version: self.schema_version.clone(),
            event_id: self.event_id.to_string(),
            event_seq: self.event_seq,
            ts: self.ts,
            actor: self.actor.clone(),
            action: self.body.action_name().to_string(),
            payload: self.body.payload()?,
        })
    }
}

/// An event that has been decided on but not yet numbered.
///
/// The orchestrator assigns `event_seq`, `event_id` and `ts` when the batch
/// is appended; nothing upstream of the store ever chooses them.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub actor: String,
    pub body: EventBody,
}

impl PendingEvent {
    #[must_use]
    pub fn new(actor: impl Into<String>, body: EventBody) -> Self {
        Self {
            actor: actor.into(),
            body,
        }
    }

    #[must_use]
    pub fn orchestrator(body: EventBody) -> Self {
        Self::new(ORCHESTRATOR, body)
    }

    #[must_use]
    pub fn stamp(self, event_seq: u64, ts: DateTime<Utc>) -> Event {
        Event::new(event_seq, self.actor, ts, self.body)
    }
}

/// Numbers a batch of pending events after `last_seq`.
#[must_use]
pub fn stamp_all(pending: Vec<PendingEvent>, last_seq: u64, ts: DateTime<Utc>) -> Vec<Event> {
    pending
        .into_iter()
        .zip(last_seq + 1..)
        .map(|(event, seq)| event.stamp(seq, ts))
        .collect()
}

impl TryFrom<EventRecord> for Event {
    type Error = serde_json::Error;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let body = EventBody::decode(&record.action, record.payload)?;
        Ok(Self {
            schema_version: record.schema_version,
            event_id: EventId::from(record.event_id),
            event_seq: record.event_seq,
            ts: record.ts,
            actor: record.actor,
            body,
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_record()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 16, 44, 23).unwrap()
    }

    #[test]
    fn vocabulary_round_trips_by_name() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("run.init"), None);
    }

    #[test]
    fn only_lifecycle_actions_belong_to_producers() {
        let producer: Vec<_> = Action::ALL
            .into_iter()
            .filter(|a| a.is_producer_action())
            .collect();
        assert_eq!(
            producer,
            vec![
                Action::Claim,
                Action::Complete,
                Action::Review,
                Action::IssueReport
            ]
        );
    }

    #[test]
    fn event_serializes_to_flat_wire_record() {
        let event = Event::new(
            3,
            "agent-a",
            ts(),
            EventBody::Claim(ClaimPayload {
                task_id: "T-1".to_string(),
                notes: None,
            }),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_id"], "EV-00000003");
        assert_eq!(json["event_seq"], 3);
        assert_eq!(json["action"], "claim");
        assert_eq!(json["payload"]["task_id"], "T-1");
        assert_eq!(json["ts"], "2026-02-23T16:44:23Z");

        let restored: Event = serde_json::from_value(json).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn unknown_action_is_kept_as_unrecognized() {
        let body = EventBody::decode("does.not.exist", serde_json::json!({"x": 1})).unwrap();
        assert_eq!(body.action(), None);
        assert_eq!(body.action_name(), "does.not.exist");
    }

    #[test]
    fn stamping_numbers_after_the_tail() {
        let pending = vec![
            PendingEvent::orchestrator(EventBody::VerifyStart(VerifyStartPayload { strict: true })),
            PendingEvent::new(
                "agent-a",
                EventBody::Claim(ClaimPayload {
                    task_id: "T-1".to_string(),
                    notes: None,
                }),
            ),
        ];
        let events = stamp_all(pending, 7, ts());
        assert_eq!(events[0].event_seq, 8);
        assert_eq!(events[1].event_id.as_str(), "EV-00000009");
        assert!(events[0].is_from_orchestrator());
        assert_eq!(events[1].actor, "agent-a");
    }

    #[test]
    fn payload_shape_errors_surface() {
        let err = EventBody::decode("claim", serde_json::json!({"notes": "no task"}));
        assert!(err.is_err());
    }
}
