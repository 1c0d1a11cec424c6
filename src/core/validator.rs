//! Fail-closed validation of producer output.
//!
//! A candidate envelope passes through seven layers in order; the first one
//! that fails decides the rejection reason and nothing else is checked:
//!
//! 1. parse: well-formed JSON object
//! 2. schema: envelope shape, forbidden fields, referenced tasks
//! 3. vocabulary/authority: known action a producer may emit
//! 4. state machine: legal transition for the task's current status
//! 5. boundary: every written path inside the kind's allowlist
//! 6. immutability: a done task only accepts the start of a hotfix
//! 7. verification gate: `complete` carries enough checks
//!
//! Validation has no side effects. An accepted output becomes pending events
//! through [`Accepted::into_pending`]; a rejection becomes a single
//! `output.rejected` through [`Rejection::into_pending`].

use crate::core::boundary::BoundaryError;
use crate::core::canonical::sha256_bytes_hex;
use crate::core::contract::AgentContract;
use crate::core::envelope::{ActivityEvent, FileUpdate, ROOT_KEYS};
use crate::core::events::{
    Action, ClaimPayload, CompletePayload, Escalation, EventBody, FileWritePayload,
    IssueReportPayload, IssueResolvePayload, OutputRejectedPayload, PendingEvent, ReviewDecision,
    ReviewPayload, TaskOutputs, TaskSpec, ViewMutatePayload,
};
use crate::core::policy::RuntimePolicy;
use crate::core::projection::Views;
use crate::core::state::{Task, TaskKind, TaskStatus};
use crate::core::transitions::{next_status, Step, TransitionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

const HOTFIX_SCOPE: &str = "src/hotfix/";
const HOTFIX_CHECKS: [&str; 2] = ["unit", "regression"];
const DEFAULT_BASELINE: &str = "B-000";

/// Reason code recorded on `output.rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ParseError,
    SchemaViolation,
    UnknownAction,
    BoundaryViolation,
    InvalidTransition,
    ImmutableDoneViolation,
    LockViolation,
    VerificationGateFailure,
    AttemptTimeout,
    ProducerFailure,
    WriteFailed,
}

impl RejectReason {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::SchemaViolation => "schema_violation",
            Self::UnknownAction => "unknown_action",
            Self::BoundaryViolation => "boundary_violation",
            Self::InvalidTransition => "invalid_transition",
            Self::ImmutableDoneViolation => "immutable_done_violation",
            Self::LockViolation => "lock_violation",
            Self::VerificationGateFailure => "verification_gate_failure",
            Self::AttemptTimeout => "attempt_timeout",
            Self::ProducerFailure => "producer_failure",
            Self::WriteFailed => "write_failed",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A refused candidate output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    /// Action the producer proposed, `unknown` when it could not be read.
    pub source_action: String,
    pub task_id: Option<String>,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            source_action: "unknown".to_string(),
            task_id: None,
        }
    }

    /// An attempt that passed its deadline without a usable reply.
    pub fn timeout(task_id: &str, message: impl Into<String>) -> Self {
        Self::new(RejectReason::AttemptTimeout, message).for_task(task_id)
    }

    /// The producer failed before returning any output.
    pub fn producer_failure(task_id: &str, message: impl Into<String>) -> Self {
        Self::new(RejectReason::ProducerFailure, message).for_task(task_id)
    }

    #[must_use]
    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    #[must_use]
    pub fn for_action(mut self, action: &str) -> Self {
        self.source_action = action.to_string();
        self
    }

    /// The `output.rejected` event recording this rejection.
    #[must_use]
    pub fn into_pending(self, attempt: u32, attempt_id: Option<Uuid>) -> PendingEvent {
        PendingEvent::orchestrator(EventBody::OutputRejected(OutputRejectedPayload {
            task_id: self.task_id,
            reason: self.reason,
            message: self.message,
            source_action: self.source_action,
            attempt,
            attempt_id,
        }))
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// What the validator knows about the submission.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Current projection the candidate is checked against.
    pub views: &'a Views,
    /// Identity of the producer; becomes the event actor.
    pub actor: &'a str,
    /// Task the producer was dispatched for, if any. A reply about another
    /// task is refused.
    pub dispatched_task: Option<&'a str>,
}

/// A candidate that passed every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub actor: String,
    pub task_id: String,
    pub action: Action,
    pub body: EventBody,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// File updates with normalized paths.
    pub file_updates: Vec<FileUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(Box<Accepted>),
    Reject(Rejection),
}

/// The validation pipeline, configured by the agent contract.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    contract: AgentContract,
}

impl Validator {
    #[must_use]
    pub const fn new(contract: AgentContract) -> Self {
        Self { contract }
    }

    #[must_use]
    pub const fn contract(&self) -> &AgentContract {
        &self.contract
    }

    /// Runs all layers against a raw producer reply.
    pub fn validate(&self, raw: &str, ctx: &ValidationContext<'_>) -> Verdict {
        match self.check(raw, ctx) {
            Ok(accepted) => {
                debug!(
                    task_id = %accepted.task_id,
                    action = accepted.action.as_str(),
                    files = accepted.file_updates.len(),
                    "output accepted"
                );
                Verdict::Accept(Box::new(accepted))
            }
            Err(rejection) => {
                debug!(
                    task_id = rejection.task_id.as_deref().unwrap_or("-"),
                    reason = rejection.reason.code(),
                    message = %rejection.message,
                    "output rejected"
                );
                Verdict::Reject(rejection)
            }
        }
    }

    fn check(&self, raw: &str, ctx: &ValidationContext<'_>) -> Result<Accepted, Rejection> {
        // Layer 1: parse.
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
            Rejection::new(RejectReason::ParseError, format!("output is not valid JSON: {e}"))
        })?;
        let Value::Object(root) = value else {
            return Err(Rejection::new(
                RejectReason::ParseError,
                "output must be a JSON object",
            ));
        };
        let reject = |reason, message: String| {
            Rejection::new(reason, message)
                .for_action(envelope_action(&root).unwrap_or("unknown"))
        };

        // Layer 2: schema.
        let (activity, file_updates) = self.check_shape(&root)?;
        let task_id = activity.task_id.as_str();
        let schema = |message: String| reject(RejectReason::SchemaViolation, message).for_task(task_id);
        if let Some(expected) = ctx.dispatched_task {
            if expected != task_id {
                return Err(schema(format!(
                    "activity_event.task_id {task_id} does not match dispatched task {expected}"
                )));
            }
        }
        let Some(task) = ctx.views.roadmap.task(task_id) else {
            return Err(reject(
                RejectReason::SchemaViolation,
                format!("task_id not found: {task_id}"),
            ));
        };
        if let Some(fixes) = activity.fixes.as_deref() {
            if ctx.views.roadmap.task(fixes).is_none() {
                return Err(schema(format!("fixes references unknown task {fixes}")));
            }
        }
        let known = Action::parse(&activity.action);
        let built = match known {
            Some(action) => action_body(action, &activity).map_err(schema)?,
            None => None,
        };

        // Layer 3: vocabulary and authority.
        let reject = |reason, message: String| reject(reason, message).for_task(task_id);
        let Some(action) = known else {
            return Err(reject(
                RejectReason::UnknownAction,
                format!("unknown action: {}", activity.action),
            ));
        };
        let Some((body, step)) = built else {
            return Err(reject(
                RejectReason::BoundaryViolation,
                format!("action {action} is reserved for the orchestrator"),
            ));
        };
        if !self.contract.allows_agent_action(action) {
            return Err(reject(
                RejectReason::UnknownAction,
                format!("action {action} is not allowed by the agent contract"),
            ));
        }

        // Layer 4: state machine.
        let from = task.status;
        let to = match step {
            Some(step) => next_status(task, step, ctx.actor).map_err(|e| {
                let reason = match e {
                    TransitionError::Done { .. } => RejectReason::ImmutableDoneViolation,
                    TransitionError::Invalid { .. } => RejectReason::InvalidTransition,
                    TransitionError::NotOwner { .. } => RejectReason::LockViolation,
                };
                reject(reason, e.to_string())
            })?,
            None => from,
        };

        // Layer 5: path boundary.
        let file_updates = self
            .check_paths(task, file_updates)
            .map_err(|e| reject(RejectReason::BoundaryViolation, e.to_string()))?;

        // Layer 6: immutability.
        if task.is_done() {
            if !file_updates.is_empty() {
                return Err(reject(
                    RejectReason::ImmutableDoneViolation,
                    format!("task {task_id} is done; its files change only through a hotfix"),
                ));
            }
            if action == Action::IssueReport && activity.fixes.as_deref() != Some(task_id) {
                return Err(reject(
                    RejectReason::ImmutableDoneViolation,
                    format!("issue.report on done task {task_id} must set fixes to open a hotfix"),
                ));
            }
        }

        // Layer 7: verification gate.
        if action == Action::Complete {
            check_gate(task, &activity)
                .map_err(|message| reject(RejectReason::VerificationGateFailure, message))?;
        }

        Ok(Accepted {
            actor: ctx.actor.to_string(),
            task_id: task_id.to_string(),
            action,
            body,
            from,
            to,
            file_updates,
        })
    }

    /// Envelope-level shape: root keys, forbidden fields, typed decode.
    fn check_shape(
        &self,
        root: &Map<String, Value>,
    ) -> Result<(ActivityEvent, Vec<FileUpdate>), Rejection> {
        let action = envelope_action(root);
        let schema = |message: String| {
            Rejection::new(RejectReason::SchemaViolation, message)
                .for_action(action.unwrap_or("unknown"))
        };

        let forbidden_root = forbidden_keys(&self.contract, root);
        if !forbidden_root.is_empty() {
            return Err(schema(format!("forbidden root fields: {forbidden_root:?}")));
        }
        let unknown_root: Vec<&str> = root
            .keys()
            .map(String::as_str)
            .filter(|k| !ROOT_KEYS.contains(k))
            .collect();
        if !unknown_root.is_empty() {
            return Err(schema(format!("unknown root keys: {unknown_root:?}")));
        }

        let Some(Value::Object(event)) = root.get("activity_event") else {
            return Err(schema("activity_event must be an object".to_string()));
        };
        for field in ["action", "task_id"] {
            let present = event
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                return Err(schema(format!("activity_event.{field} is required")));
            }
        }
        let forbidden = forbidden_keys(&self.contract, event);
        if !forbidden.is_empty() {
            return Err(schema(format!("forbidden activity_event fields: {forbidden:?}")));
        }
        if event.contains_key("escalation") {
            return Err(schema(
                "activity_event.escalation is assigned by the orchestrator".to_string(),
            ));
        }

        let activity: ActivityEvent = serde_json::from_value(Value::Object(event.clone()))
            .map_err(|e| schema(format!("invalid activity_event: {e}")))?;
        let file_updates = match root.get("file_updates") {
            None | Some(Value::Null) => Vec::new(),
            Some(updates) => serde_json::from_value(updates.clone())
                .map_err(|e| schema(format!("invalid file_updates: {e}")))?,
        };
        Ok((activity, file_updates))
    }

    fn check_paths(
        &self,
        task: &Task,
        updates: Vec<FileUpdate>,
    ) -> Result<Vec<FileUpdate>, BoundaryError> {
        if updates.is_empty() {
            return Ok(updates);
        }
        let kind = task.task_kind.as_str();
        let Some(boundary) = self.contract.boundary_for(kind) else {
            return Err(BoundaryError::OutsideAllowlist {
                kind: kind.to_string(),
                path: updates[0].path.clone(),
            });
        };
        let scope_patch = (self.contract.boundaries.patch_scope.enabled && task.is_hotfix)
            .then(|| task.scope_patch.as_deref().unwrap_or_default());

        updates
            .into_iter()
            .map(|update| -> Result<FileUpdate, BoundaryError> {
                let path = boundary.check_write(kind, &update.path, scope_patch)?;
                Ok(FileUpdate {
                    path,
                    content: update.content,
                })
            })
            .collect()
    }
}

fn envelope_action(root: &Map<String, Value>) -> Option<&str> {
    root.get("activity_event")?.get("action")?.as_str()
}

fn forbidden_keys<'m>(contract: &AgentContract, map: &'m Map<String, Value>) -> Vec<&'m str> {
    map.keys()
        .map(String::as_str)
        .filter(|k| contract.is_forbidden_field(k))
        .collect()
}

/// Typed payload for a producer action; `None` for orchestrator actions.
fn action_body(
    action: Action,
    activity: &ActivityEvent,
) -> Result<Option<(EventBody, Option<Step>)>, String> {
    let task_id = activity.task_id.clone();
    let built = match action {
        Action::Claim => (
            EventBody::Claim(ClaimPayload {
                task_id,
                notes: activity.notes.clone(),
            }),
            Some(Step::Claim),
        ),
        Action::Complete => (
            EventBody::Complete(CompletePayload {
                task_id,
                verification: activity.verification.clone(),
                issue_id: activity.issue_id.clone(),
                fixes: activity.fixes.clone(),
                notes: activity.notes.clone(),
            }),
            Some(Step::Complete),
        ),
        Action::Review => {
            let Some(decision) = activity.decision else {
                return Err("review requires decision approve or request_changes".to_string());
            };
            (
                EventBody::Review(ReviewPayload {
                    task_id,
                    decision,
                    notes: activity.notes.clone(),
                }),
                Some(Step::Review(decision)),
            )
        }
        Action::IssueReport => {
            let Some(issue_id) = activity.issue_id.clone().filter(|id| !id.trim().is_empty())
            else {
                return Err("issue.report requires issue_id".to_string());
            };
            let object_or_empty = |v: &Option<Value>| match v {
                Some(Value::Object(map)) => Ok(Value::Object(map.clone())),
                None => Ok(Value::Object(Map::new())),
                Some(_) => Err("affected and evidence must be objects".to_string()),
            };
            (
                EventBody::IssueReport(IssueReportPayload {
                    issue_id,
                    task_id: Some(task_id),
                    severity: activity.severity.unwrap_or_default(),
                    title: activity.title.clone(),
                    affected: object_or_empty(&activity.affected)?,
                    evidence: object_or_empty(&activity.evidence)?,
                    fixes: activity.fixes.clone(),
                    scope_patch: activity.scope_patch.clone(),
                    required_verification: activity.required_verification.clone(),
                    category: activity.category.clone(),
                    subtype: activity.subtype.clone(),
                    lesson: activity.lesson.clone(),
                    escalation: None,
                }),
                None,
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(built))
}

fn check_gate(task: &Task, activity: &ActivityEvent) -> Result<(), String> {
    let checks = activity
        .verification
        .as_ref()
        .map_or(0, |v| v.checks.iter().filter(|c| !c.trim().is_empty()).count());
    let required = task.min_verification_checks();
    if checks < required {
        return Err(format!(
            "complete on {} requires at least {required} verification check(s), got {checks}",
            task.task_id
        ));
    }
    if task.is_hotfix {
        if activity.issue_id.is_none() || activity.fixes.is_none() {
            return Err("hotfix complete requires issue_id and fixes".to_string());
        }
        if activity.issue_id != task.issue_id || activity.fixes != task.fixes {
            return Err(format!(
                "hotfix complete must reference issue {} and task {}",
                task.issue_id.as_deref().unwrap_or("-"),
                task.fixes.as_deref().unwrap_or("-")
            ));
        }
    }
    Ok(())
}

impl Accepted {
    /// Expands into the ordered batch appended for this output:
    /// the domain event, one `orchestrator.file.write` per file, one
    /// `orchestrator.view.mutate`, then derived hotfix events.
    #[must_use]
    pub fn into_pending(self, views: &Views, policy: &RuntimePolicy) -> Vec<PendingEvent> {
        let mut body = self.body;
        let task = views.roadmap.task(&self.task_id);
        if let EventBody::IssueReport(report) = &mut body {
            report.escalation = Some(Escalation {
                action: policy.escalation_for(report.severity),
                attempts: task.map_or(0, |t| t.attempts),
            });
        }
        let hotfix = match &body {
            EventBody::IssueReport(report) => report
                .fixes
                .as_deref()
                .map(|fixes| hotfix_spec(report, fixes))
                .filter(|spec| views.roadmap.task(&spec.task_id).is_none()),
            _ => None,
        };

        let mut pending = vec![PendingEvent::new(self.actor, body)];
        for update in &self.file_updates {
            pending.push(PendingEvent::orchestrator(EventBody::FileWrite(
                FileWritePayload {
                    task_id: self.task_id.clone(),
                    path: update.path.clone(),
                    bytes: update.content.len(),
                    sha256: sha256_bytes_hex(update.content.as_bytes()),
                },
            )));
        }
        pending.push(PendingEvent::orchestrator(EventBody::ViewMutate(
            ViewMutatePayload {
                task_id: self.task_id.clone(),
                source_action: self.action.as_str().to_string(),
                from: Some(self.from),
                to: Some(self.to),
            },
        )));

        if let Some(spec) = hotfix {
            pending.push(PendingEvent::orchestrator(EventBody::HotfixCreate(spec)));
        }

        let approved_hotfix = self.to == TaskStatus::Done
            && self.from == TaskStatus::Review
            && task.is_some_and(|t| t.is_hotfix);
        if approved_hotfix {
            let open_issue = task
                .and_then(|t| t.issue_id.as_deref())
                .and_then(|id| views.issues.issue(id))
                .filter(|issue| issue.is_open());
            if let Some(issue) = open_issue {
                pending.push(PendingEvent::orchestrator(EventBody::IssueResolve(
                    IssueResolvePayload {
                        issue_id: issue.issue_id.clone(),
                        resolution: Some(json!({
                            "hotfix_task_id": self.task_id,
                            "decision": ReviewDecision::Approve,
                        })),
                    },
                )));
            }
        }
        pending
    }
}

/// Creation payload of the hotfix task opened by a report with `fixes`.
fn hotfix_spec(report: &IssueReportPayload, fixes: &str) -> TaskSpec {
    let task_id = format!("HF-{}", report.issue_id);
    TaskSpec {
        description: Some(format!(
            "Apply a minimal hotfix for issue {} without touching done task {fixes}.",
            report.issue_id
        )),
        targets: vec![report.issue_id.clone()],
        outputs: TaskOutputs {
            files: vec![format!("{HOTFIX_SCOPE}{task_id}.txt")],
        },
        is_hotfix: true,
        issue_id: Some(report.issue_id.clone()),
        fixes: Some(fixes.to_string()),
        scope_patch: Some(
            report
                .scope_patch
                .clone()
                .unwrap_or_else(|| vec![HOTFIX_SCOPE.to_string()]),
        ),
        required_verification: Some(
            report
                .required_verification
                .clone()
                .unwrap_or_else(|| HOTFIX_CHECKS.map(str::to_string).to_vec()),
        ),
        baseline_id: Some(
            report
                .baseline_id()
                .unwrap_or_else(|| DEFAULT_BASELINE.to_string()),
        ),
        ..TaskSpec::new(
            task_id,
            TaskKind::Impl,
            format!("Hotfix for {}", report.issue_id),
        )
    }
}
