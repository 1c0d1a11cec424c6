//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Why? What can be done next?
//!
//! Producer-side rejections are *not* errors: they are recorded facts
//! (`output.rejected`) and live in [`crate::core::validator`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// System-level errors (IO, locking, serialization).
    System,
    /// Event store integrity errors.
    Store,
    /// Producer adapter errors.
    Producer,
    /// Verification failures (mismatch, corruption).
    Verification,
    /// User input errors.
    User,
    /// Policy violations (orchestrator-only operations, escalation halts).
    Policy,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Store => write!(f, "store"),
            Self::Producer => write!(f, "producer"),
            Self::Verification => write!(f, "verification"),
            Self::User => write!(f, "user"),
            Self::Policy => write!(f, "policy"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasklogError {
    /// Error category for classification.
    pub category: ErrorCategory,
    /// Unique error code within category.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component that originated the error.
    pub origin: String,
    /// Whether this error is potentially recoverable.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Additional context key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl TasklogError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets whether the error is recoverable.
    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn system(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::System, code, message, origin)
    }

    /// Creates a store integrity error. Never recoverable: a broken log needs
    /// snapshot-based manual recovery.
    #[must_use]
    pub fn store(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Store, code, message, origin)
    }

    #[must_use]
    pub fn producer(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Producer, code, message, origin).recoverable(true)
    }

    #[must_use]
    pub fn verification(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Verification, code, message, origin)
    }

    /// Creates a user input error.
    #[must_use]
    pub fn user(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::User, code, message, origin).recoverable(true)
    }

    #[must_use]
    pub fn policy(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Policy, code, message, origin)
    }
}

impl std::fmt::Display for TasklogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for TasklogError {}

impl From<crate::storage::event_store::EventStoreError> for TasklogError {
    fn from(err: crate::storage::event_store::EventStoreError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            crate::storage::event_store::EventStoreError::Io(_)
            | crate::storage::event_store::EventStoreError::Serialization(_) => {
                Self::system(code, message, "storage:event_store")
            }
            crate::storage::event_store::EventStoreError::WriterLocked(_) => {
                Self::system(code, message, "storage:event_store")
                    .with_hint("Another orchestrator holds the event store; wait for it to exit")
            }
            _ => Self::store(code, message, "storage:event_store")
                .with_hint("Inspect .roadmap/snapshots/ and repair the log manually"),
        }
    }
}

impl From<crate::storage::views::ViewStoreError> for TasklogError {
    fn from(err: crate::storage::views::ViewStoreError) -> Self {
        Self::system(err.code(), err.to_string(), "storage:views")
    }
}

impl From<crate::core::projection::ProjectionError> for TasklogError {
    fn from(err: crate::core::projection::ProjectionError) -> Self {
        Self::store(err.code(), err.to_string(), "core:projection")
            .with_hint("Run `tasklog verify`; the log no longer replays consistently")
    }
}

/// Result type using `TasklogError`.
pub type Result<T> = std::result::Result<T, TasklogError>;

/// Exit codes for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    /// Verification reported `mismatch` or `corrupted`.
    VerifyFailed = 2,
    NotFound = 3,
    Conflict = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}
