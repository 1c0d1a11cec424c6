//! Pure projection: event sequence → materialized views.
//!
//! [`project`] folds the full ordered event sequence into a fresh
//! accumulator every time. It performs no I/O and reads no clock, so the
//! same input always yields the same views.
//!
//! Lifecycle events are replayed through the same state machine the
//! validator uses. An event the state machine cannot apply means the log is
//! inconsistent and projection fails with a [`ProjectionError`]. Actions
//! outside the vocabulary are ignored.

use crate::core::canonical::projection_hash;
use crate::core::events::{
    Event, EventBody, IssueReportPayload, OutputRejectedPayload, TaskSpec, ENGINE_VERSION,
    SCHEMA_VERSION,
};
use crate::core::state::{
    Issue, IssueLinks, IssueStatus, IssueTimeline, Lesson, RunStatus, SourceRef, Task, TaskStatus,
    VerifyStatus,
};
use crate::core::transitions::{next_status, Step, TransitionError};
use crate::core::validator::RejectReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Project name recorded in the roadmap view.
pub const DEFAULT_PROJECT_NAME: &str = "tasklog-core";
/// Directory audited by the verifier.
pub const AUDIT_SCOPE: &str = ".roadmap/";
const GENERATED_BY: &str = "tasklog.project";
const SOURCE_EVENT_STORE: &str = ".roadmap/activity.jsonl";

/// The stored log cannot be replayed consistently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("event {event_seq}: unknown task {task_id}")]
    UnknownTask { event_seq: u64, task_id: String },
    #[error("event {event_seq}: task {task_id} already exists")]
    DuplicateTask { event_seq: u64, task_id: String },
    #[error("event {event_seq}: unknown issue {issue_id}")]
    UnknownIssue { event_seq: u64, issue_id: String },
    #[error("event {event_seq}: {source}")]
    Transition {
        event_seq: u64,
        #[source]
        source: TransitionError,
    },
    #[error("hash computation failed: {0}")]
    Hash(String),
}

impl ProjectionError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownTask { .. } => "task_not_found",
            Self::DuplicateTask { .. } => "task_duplicate",
            Self::UnknownIssue { .. } => "issue_not_found",
            Self::Transition {
                source: TransitionError::Done { .. },
                ..
            } => "done_regression",
            Self::Transition {
                source: TransitionError::NotOwner { .. },
                ..
            } => "not_lock_owner",
            Self::Transition {
                source: TransitionError::Invalid { .. },
                ..
            } => "invalid_transition",
            Self::Hash(_) => "hash_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub last_event_seq: u64,
    pub projection_hash_sha256: String,
    pub verify_status: VerifyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoadmapMeta {
    pub schema_version: String,
    pub engine_version: String,
    pub immutable_done: bool,
    pub master_correlation_id: Option<String>,
    pub run: RunSummary,
    /// Timestamp of the last event, `None` for an empty log.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub audit_scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIndexes {
    pub by_status: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
}

/// `.roadmap/roadmap.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoadmapView {
    pub meta: RoadmapMeta,
    pub project: ProjectInfo,
    pub tasks: Vec<Task>,
    pub indexes: TaskIndexes,
}

impl RoadmapView {
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// True when at least one task exists and every task is done.
    #[must_use]
    pub fn all_done(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(Task::is_done)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMeta {
    pub schema_version: String,
    pub engine_version: String,
    pub generated_by: String,
    pub source_event_store: String,
    pub last_event_seq: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueIndexes {
    pub open_by_baseline: BTreeMap<String, Vec<String>>,
}

/// `.roadmap/issues.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuesView {
    pub meta: ViewMeta,
    pub issues: Vec<Issue>,
    pub indexes: IssueIndexes,
}

impl IssuesView {
    #[must_use]
    pub fn issue(&self, issue_id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.issue_id == issue_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonIndexes {
    pub by_task_kind: BTreeMap<String, Vec<String>>,
    pub by_enforcement_applies_to: BTreeMap<String, Vec<String>>,
}

/// `.roadmap/lessons.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonsView {
    pub meta: ViewMeta,
    pub lessons: Vec<Lesson>,
    pub indexes: LessonIndexes,
}

impl LessonsView {
    /// Lessons whose scope covers `kind`.
    #[must_use]
    pub fn for_kind(&self, kind: &str) -> Vec<Lesson> {
        self.lessons
            .iter()
            .filter(|l| l.scope.task_kinds.iter().any(|k| k == kind))
            .cloned()
            .collect()
    }
}

/// All materialized views at one log prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Views {
    pub roadmap: RoadmapView,
    pub issues: IssuesView,
    pub lessons: LessonsView,
}

impl Views {
    #[must_use]
    pub const fn last_event_seq(&self) -> u64 {
        self.roadmap.meta.run.last_event_seq
    }

    #[must_use]
    pub fn projection_hash(&self) -> &str {
        &self.roadmap.meta.run.projection_hash_sha256
    }
}

/// Accumulator for one fold.
struct Fold {
    master_correlation_id: Option<String>,
    run: RunSummary,
    updated_at: Option<DateTime<Utc>>,
    tasks: Vec<Task>,
    positions: HashMap<String, usize>,
    issues: BTreeMap<String, Issue>,
    lessons: Vec<Lesson>,
}

impl Fold {
    fn new() -> Self {
        Self {
            master_correlation_id: None,
            run: RunSummary {
                run_id: None,
                status: RunStatus::Initialized,
                last_event_seq: 0,
                projection_hash_sha256: String::new(),
                verify_status: VerifyStatus::Unknown,
            },
            updated_at: None,
            tasks: Vec::new(),
            positions: HashMap::new(),
            issues: BTreeMap::new(),
            lessons: Vec::new(),
        }
    }

    fn task_mut(&mut self, seq: u64, task_id: &str) -> Result<&mut Task, ProjectionError> {
        match self.positions.get(task_id) {
            Some(&index) => Ok(&mut self.tasks[index]),
            None => Err(ProjectionError::UnknownTask {
                event_seq: seq,
                task_id: task_id.to_string(),
            }),
        }
    }

    fn apply(&mut self, event: &Event) -> Result<(), ProjectionError> {
        let seq = event.event_seq;
        match &event.body {
            EventBody::RunStart(p) => {
                self.master_correlation_id.clone_from(&p.master_correlation_id);
                if p.run_id.is_some() {
                    self.run.run_id.clone_from(&p.run_id);
                }
                self.run.status = p.status;
            }
            EventBody::RunEnd(p) => self.run.status = p.status,
            EventBody::TaskCreate(spec) => self.create_task(seq, spec)?,
            EventBody::HotfixCreate(spec) => {
                self.create_task(seq, spec)?;
                if let Some(issue) = spec
                    .issue_id
                    .as_deref()
                    .and_then(|id| self.issues.get_mut(id))
                {
                    issue.links.hotfix_task_id = Some(spec.task_id.clone());
                }
            }
            EventBody::Claim(p) => {
                let task = self.task_mut(seq, &p.task_id)?;
                task.status = step(seq, task, Step::Claim, &event.actor)?;
                task.assigned_to = Some(event.actor.clone());
                task.started_at = Some(event.ts);
            }
            EventBody::Complete(p) => {
                let task = self.task_mut(seq, &p.task_id)?;
                task.status = step(seq, task, Step::Complete, &event.actor)?;
                if let Some(verification) = &p.verification {
                    task.verification = Some(verification.clone());
                }
                if p.issue_id.is_some() {
                    task.issue_id.clone_from(&p.issue_id);
                }
                if p.fixes.is_some() {
                    task.fixes.clone_from(&p.fixes);
                }
            }
            EventBody::Review(p) => {
                let task = self.task_mut(seq, &p.task_id)?;
                task.status = step(seq, task, Step::Review(p.decision), &event.actor)?;
                if task.is_done() {
                    task.completed_at = Some(event.ts);
                }
            }
            EventBody::IssueReport(p) => self.report_issue(event, p),
            EventBody::IssueResolve(p) => {
                let Some(issue) = self.issues.get_mut(&p.issue_id) else {
                    return Err(ProjectionError::UnknownIssue {
                        event_seq: seq,
                        issue_id: p.issue_id.clone(),
                    });
                };
                issue.status = IssueStatus::Resolved;
                issue.resolution = Some(p.resolution.clone().unwrap_or_else(empty_object));
                issue.timeline.resolved_event_seq = Some(seq);

                let escalated_task = issue
                    .escalation
                    .and(issue.links.reported_by_task_id.clone());
                for task in self.tasks.iter_mut().filter(|t| !t.is_done()) {
                    let blocked_here = task.blocked_by.as_deref() == Some(p.issue_id.as_str());
                    if blocked_here || escalated_task.as_deref() == Some(task.task_id.as_str()) {
                        task.blocked_by = None;
                        task.attempts = 0;
                    }
                }
            }
            EventBody::OutputRejected(p) => self.record_rejection(p),
            EventBody::VerifyOk(_) => self.run.verify_status = VerifyStatus::Ok,
            EventBody::VerifyFail(p) => self.run.verify_status = p.verify_status,
            EventBody::FileWrite(_)
            | EventBody::ViewMutate(_)
            | EventBody::VerifyStart(_)
            | EventBody::Unrecognized { .. } => {}
        }

        self.run.last_event_seq = seq;
        self.updated_at = Some(event.ts);
        Ok(())
    }

    fn create_task(&mut self, seq: u64, spec: &TaskSpec) -> Result<(), ProjectionError> {
        if self.positions.contains_key(&spec.task_id) {
            return Err(ProjectionError::DuplicateTask {
                event_seq: seq,
                task_id: spec.task_id.clone(),
            });
        }
        self.positions.insert(spec.task_id.clone(), self.tasks.len());
        self.tasks.push(Task::from_spec(spec));
        Ok(())
    }

    fn report_issue(&mut self, event: &Event, p: &IssueReportPayload) {
        let issue = self
            .issues
            .entry(p.issue_id.clone())
            .or_insert_with(|| Issue {
                issue_id: p.issue_id.clone(),
                status: IssueStatus::Open,
                severity: p.severity,
                title: p.title.clone().unwrap_or_else(|| p.issue_id.clone()),
                baseline_id: p.baseline_id(),
                affected: p.affected.clone(),
                evidence: p.evidence.clone(),
                resolution: None,
                links: IssueLinks {
                    reported_by_task_id: p.task_id.clone(),
                    fixes_task_id: p.fixes.clone(),
                    hotfix_task_id: None,
                },
                timeline: IssueTimeline {
                    created_event_seq: event.event_seq,
                    resolved_event_seq: None,
                },
                escalation: None,
            });
        // A repeated report reopens and refreshes the issue.
        issue.status = IssueStatus::Open;
        issue.severity = p.severity;
        if let Some(title) = &p.title {
            issue.title.clone_from(title);
        }
        if !is_empty_object(&p.evidence) {
            issue.evidence = p.evidence.clone();
        }
        if p.escalation.is_some() {
            issue.escalation = p.escalation;
        }

        if let (Some(escalation), Some(task_id)) = (p.escalation, p.task_id.as_deref()) {
            if escalation.action.blocks_task() {
                if let Some(&index) = self.positions.get(task_id) {
                    let task = &mut self.tasks[index];
                    if !task.is_done() {
                        task.blocked_by = Some(p.issue_id.clone());
                    }
                }
            }
        }

        if let Some(draft) = p.lesson.as_ref().filter(|_| p.is_lesson()) {
            let lesson_id = format!("LES-{:04}", self.lessons.len() + 1);
            self.lessons.push(Lesson {
                title: p.title.clone().unwrap_or_else(|| lesson_id.clone()),
                lesson_id,
                status: "active".to_string(),
                created_at: event.ts,
                mistake: draft.mistake.clone(),
                rule: draft.rule.clone(),
                scope: draft.scope.clone(),
                enforcement: draft.enforcement.clone(),
                source_refs: vec![SourceRef {
                    task_id: p.task_id.clone(),
                    event_id: event.event_id.to_string(),
                }],
            });
        }
    }

    fn record_rejection(&mut self, p: &OutputRejectedPayload) {
        let Some(&index) = p.task_id.as_ref().and_then(|id| self.positions.get(id)) else {
            return;
        };
        let task = &mut self.tasks[index];
        if task.is_done() {
            return;
        }
        task.attempts += 1;
        if p.reason == RejectReason::AttemptTimeout && task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Todo;
            task.assigned_to = None;
            task.started_at = None;
        }
    }

    fn finish(self, project_name: &str) -> Result<Views, ProjectionError> {
        let mut indexes = TaskIndexes::default();
        for task in &self.tasks {
            *indexes
                .by_status
                .entry(task.status.as_str().to_string())
                .or_default() += 1;
            *indexes
                .by_kind
                .entry(task.task_kind.as_str().to_string())
                .or_default() += 1;
        }

        let mut roadmap = RoadmapView {
            meta: RoadmapMeta {
                schema_version: SCHEMA_VERSION.to_string(),
                engine_version: ENGINE_VERSION.to_string(),
                immutable_done: true,
                master_correlation_id: self.master_correlation_id,
                run: self.run,
                updated_at: self.updated_at,
            },
            project: ProjectInfo {
                name: project_name.to_string(),
                audit_scope: AUDIT_SCOPE.to_string(),
            },
            tasks: self.tasks,
            indexes,
        };
        roadmap.meta.run.projection_hash_sha256 =
            projection_hash(&roadmap).map_err(|e| ProjectionError::Hash(e.to_string()))?;

        let last_event_seq = roadmap.meta.run.last_event_seq;
        let view_meta = ViewMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            generated_by: GENERATED_BY.to_string(),
            source_event_store: SOURCE_EVENT_STORE.to_string(),
            last_event_seq,
            updated_at: self.updated_at,
        };

        let issues: Vec<Issue> = self.issues.into_values().collect();
        let mut issue_indexes = IssueIndexes::default();
        for issue in issues.iter().filter(|i| i.is_open()) {
            let baseline = issue.baseline_id.as_deref().unwrap_or("unknown");
            issue_indexes
                .open_by_baseline
                .entry(baseline.to_string())
                .or_default()
                .push(issue.issue_id.clone());
        }

        let mut lesson_indexes = LessonIndexes::default();
        for lesson in &self.lessons {
            for kind in &lesson.scope.task_kinds {
                lesson_indexes
                    .by_task_kind
                    .entry(kind.clone())
                    .or_default()
                    .push(lesson.lesson_id.clone());
            }
            lesson_indexes
                .by_enforcement_applies_to
                .entry(lesson.enforcement.applies_to.clone())
                .or_default()
                .push(lesson.lesson_id.clone());
        }

        Ok(Views {
            roadmap,
            issues: IssuesView {
                meta: view_meta.clone(),
                issues,
                indexes: issue_indexes,
            },
            lessons: LessonsView {
                meta: view_meta,
                lessons: self.lessons,
                indexes: lesson_indexes,
            },
        })
    }
}

fn step(seq: u64, task: &Task, step: Step, actor: &str) -> Result<TaskStatus, ProjectionError> {
    next_status(task, step, actor).map_err(|source| ProjectionError::Transition {
        event_seq: seq,
        source,
    })
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(serde_json::Map::is_empty)
}

/// Projects the full event sequence.
pub fn project(events: &[Event]) -> Result<Views, ProjectionError> {
    project_named(events, DEFAULT_PROJECT_NAME)
}

/// Projects the full event sequence under a given project name.
pub fn project_named(events: &[Event], project_name: &str) -> Result<Views, ProjectionError> {
    let mut fold = Fold::new();
    for event in events {
        fold.apply(event)?;
    }
    fold.finish(project_name)
}
