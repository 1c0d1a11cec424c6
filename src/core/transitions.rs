//! Task state machine.
//!
//! ```text
//! todo --claim--> in_progress --complete--> review --approve--> done
//!                      ^                      |
//!                      +---request_changes----+
//! ```
//!
//! `done` is terminal. The validator uses these rules to reject proposals;
//! the projection uses the same rules to detect an inconsistent log.

use crate::core::events::ReviewDecision;
use crate::core::state::{Task, TaskStatus};

/// A lifecycle step a producer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Claim,
    Complete,
    Review(ReviewDecision),
}

impl Step {
    #[must_use]
    pub const fn action_name(self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Complete => "complete",
            Self::Review(_) => "review",
        }
    }
}

/// Why a step cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("task {task_id} is done and immutable")]
    Done { task_id: String },
    #[error("{step} is not valid for task {task_id} in status {from}")]
    Invalid {
        task_id: String,
        step: &'static str,
        from: TaskStatus,
    },
    #[error("actor {actor} does not hold the lock on {task_id} (owner: {})", owner.as_deref().unwrap_or("none"))]
    NotOwner {
        task_id: String,
        actor: String,
        owner: Option<String>,
    },
}

/// Returns the status `task` moves to when `actor` performs `step`.
pub fn next_status(task: &Task, step: Step, actor: &str) -> Result<TaskStatus, TransitionError> {
    if task.is_done() {
        return Err(TransitionError::Done {
            task_id: task.task_id.clone(),
        });
    }

    let invalid = || TransitionError::Invalid {
        task_id: task.task_id.clone(),
        step: step.action_name(),
        from: task.status,
    };

    match step {
        Step::Claim => {
            if task.status != TaskStatus::Todo || task.assigned_to.is_some() {
                return Err(invalid());
            }
            Ok(TaskStatus::InProgress)
        }
        Step::Complete => {
            if task.status != TaskStatus::InProgress {
                return Err(invalid());
            }
            ensure_owner(task, actor)?;
            Ok(TaskStatus::Review)
        }
        Step::Review(decision) => {
            if task.status != TaskStatus::Review {
                return Err(invalid());
            }
            ensure_owner(task, actor)?;
            Ok(match decision {
                ReviewDecision::Approve => TaskStatus::Done,
                ReviewDecision::RequestChanges => TaskStatus::InProgress,
            })
        }
    }
}

fn ensure_owner(task: &Task, actor: &str) -> Result<(), TransitionError> {
    if task.assigned_to.as_deref() == Some(actor) {
        Ok(())
    } else {
        Err(TransitionError::NotOwner {
            task_id: task.task_id.clone(),
            actor: actor.to_string(),
            owner: task.assigned_to.clone(),
        })
    }
}
