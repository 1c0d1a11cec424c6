//! Scheduler - work selection and dispatch context.
//!
//! Selection is a pure function of the projected roadmap. Actionable tasks
//! are ordered by status (`review`, then `in_progress`, then `todo` with
//! every dependency done) and, within a status, by creation order.

use super::contract::AgentContract;
use super::policy::RuntimePolicy;
use super::projection::{ProjectInfo, RoadmapView, RunSummary, Views};
use super::state::{Lesson, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Result of a scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleResult<'a> {
    /// The next task to dispatch.
    Ready(&'a Task),
    /// Every task is done.
    Complete,
    /// Tasks remain but none can be dispatched (dependencies, escalation or
    /// exhausted attempts).
    Blocked(Vec<String>),
    /// The roadmap has no tasks.
    Empty,
}

/// Scheduler over one projected roadmap.
pub struct Scheduler<'a> {
    roadmap: &'a RoadmapView,
    max_attempts: u32,
}

impl<'a> Scheduler<'a> {
    /// Creates a new scheduler.
    #[must_use]
    pub const fn new(roadmap: &'a RoadmapView, policy: &RuntimePolicy) -> Self {
        Self {
            roadmap,
            max_attempts: policy.max_attempts,
        }
    }

    /// Checks if all dependencies of a task are done.
    ///
    /// A dependency that names no known task is never satisfied.
    #[must_use]
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|dep| self.roadmap.task(dep).is_some_and(Task::is_done))
    }

    /// Whether the retry budget or an escalation holds the task back.
    #[must_use]
    pub fn is_held(&self, task: &Task) -> bool {
        task.blocked_by.is_some() || task.attempts >= self.max_attempts
    }

    fn priority(&self, task: &Task) -> Option<u8> {
        if self.is_held(task) {
            return None;
        }
        match task.status {
            TaskStatus::Review => Some(0),
            TaskStatus::InProgress => Some(1),
            TaskStatus::Todo if self.dependencies_satisfied(task) => Some(2),
            TaskStatus::Todo | TaskStatus::Done => None,
        }
    }

    /// The next actionable task, if any.
    #[must_use]
    pub fn next_task(&self) -> Option<&'a Task> {
        self.roadmap
            .tasks
            .iter()
            .enumerate()
            .filter_map(|(order, task)| self.priority(task).map(|p| (p, order, task)))
            .min_by_key(|(priority, order, _)| (*priority, *order))
            .map(|(_, _, task)| task)
    }

    /// Gets the current scheduling decision.
    #[must_use]
    pub fn schedule(&self) -> ScheduleResult<'a> {
        if self.roadmap.tasks.is_empty() {
            return ScheduleResult::Empty;
        }
        if let Some(task) = self.next_task() {
            return ScheduleResult::Ready(task);
        }
        let remaining: Vec<String> = self
            .roadmap
            .tasks
            .iter()
            .filter(|t| !t.is_done())
            .map(|t| t.task_id.clone())
            .collect();
        if remaining.is_empty() {
            ScheduleResult::Complete
        } else {
            ScheduleResult::Blocked(remaining)
        }
    }
}

/// One dispatch of a task to a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique attempt ID.
    pub attempt_id: Uuid,
    pub task_id: String,
    /// Attempt number (1-indexed), derived from the task's recorded attempts.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Attempt {
    /// Starts an attempt for `task` at `now`.
    #[must_use]
    pub fn start(task: &Task, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            attempt_id: Uuid::new_v4(),
            task_id: task.task_id.clone(),
            number: task.attempts + 1,
            started_at: now,
            deadline: now + ttl,
        }
    }

    /// Whether a reply observed at `at` arrived after the deadline.
    #[must_use]
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        at > self.deadline
    }

    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        u64::try_from((self.deadline - self.started_at).num_seconds()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchBoundaries {
    pub read: Vec<String>,
    pub write: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_write: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_patch: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPack {
    pub run: RunSummary,
    pub project: ProjectInfo,
    /// Dependencies of the task with their current status.
    pub dependencies: Vec<DependencyStatus>,
    /// Active lessons scoped to the task's kind.
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub task_id: String,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub master_correlation_id: Option<String>,
    pub task_id: String,
    pub attempt_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptInfo {
    pub number: u32,
    pub max_attempts: u32,
    pub ttl_secs: u64,
    pub deadline: DateTime<Utc>,
}

/// The purified view handed to a producer: the task, its boundaries and a
/// filtered slice of the projection. Never raw log history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub task: Task,
    pub boundaries: DispatchBoundaries,
    pub context_pack: ContextPack,
    pub correlation: Correlation,
    pub attempt: AttemptInfo,
}

impl DispatchContext {
    #[must_use]
    pub fn build(
        views: &Views,
        task: &Task,
        contract: &AgentContract,
        policy: &RuntimePolicy,
        attempt: &Attempt,
    ) -> Self {
        let boundary = contract.boundary_for(task.task_kind.as_str());
        let roadmap = &views.roadmap;
        Self {
            task: task.clone(),
            boundaries: DispatchBoundaries {
                read: boundary.map(|b| b.read.clone()).unwrap_or_default(),
                write: boundary.map(|b| b.write.clone()).unwrap_or_default(),
                forbidden_write: boundary
                    .map(|b| b.forbidden_write.clone())
                    .unwrap_or_default(),
                scope_patch: task.scope_patch.clone().filter(|_| task.is_hotfix),
            },
            context_pack: ContextPack {
                run: roadmap.meta.run.clone(),
                project: roadmap.project.clone(),
                dependencies: task
                    .depends_on
                    .iter()
                    .map(|dep| DependencyStatus {
                        task_id: dep.clone(),
                        status: roadmap.task(dep).map(|t| t.status),
                    })
                    .collect(),
                lessons: views.lessons.for_kind(task.task_kind.as_str()),
            },
            correlation: Correlation {
                master_correlation_id: roadmap.meta.master_correlation_id.clone(),
                task_id: task.task_id.clone(),
                attempt_id: attempt.attempt_id,
            },
            attempt: AttemptInfo {
                number: attempt.number,
                max_attempts: policy.max_attempts,
                ttl_secs: attempt.ttl_secs(),
                deadline: attempt.deadline,
            },
        }
    }
}
