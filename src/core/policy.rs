//! Runtime policy consumed by the orchestration cycle.
//!
//! Read-only configuration loaded from `.roadmap/policy.yaml`.

use crate::core::state::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the cycle does when an issue of a given severity is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    LogOnly,
    LogAndFlag,
    BlockTask,
    HaltPipeline,
}

impl EscalationAction {
    /// Whether the affected task stops being dispatched.
    #[must_use]
    pub const fn blocks_task(self) -> bool {
        matches!(self, Self::BlockTask | Self::HaltPipeline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchRecovery {
    /// Reproject once; halt if the mismatch persists.
    ReprojectOrHalt,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionRecovery {
    HaltAndSnapshot,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityEscalation {
    pub low: EscalationAction,
    pub medium: EscalationAction,
    pub high: EscalationAction,
    pub critical: EscalationAction,
}

impl Default for SeverityEscalation {
    fn default() -> Self {
        Self {
            low: EscalationAction::LogOnly,
            medium: EscalationAction::LogAndFlag,
            high: EscalationAction::BlockTask,
            critical: EscalationAction::HaltPipeline,
        }
    }
}

impl SeverityEscalation {
    #[must_use]
    pub const fn for_severity(&self, severity: Severity) -> EscalationAction {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recovery {
    pub on_mismatch: MismatchRecovery,
    pub on_corruption: CorruptionRecovery,
    /// Snapshots kept under `.roadmap/snapshots/`; older ones are evicted first.
    pub max_snapshots: usize,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            on_mismatch: MismatchRecovery::ReprojectOrHalt,
            on_corruption: CorruptionRecovery::HaltAndSnapshot,
            max_snapshots: 5,
        }
    }
}

/// The full runtime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    pub attempt_ttl_secs: u64,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub escalation: SeverityEscalation,
    pub recovery: Recovery,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            attempt_ttl_secs: 30 * 60,
            max_attempts: 3,
            cooldown_secs: 0,
            escalation: SeverityEscalation::default(),
            recovery: Recovery::default(),
        }
    }
}

impl RuntimePolicy {
    /// Loads the policy, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let policy: Self = serde_yaml::from_str(&content)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::Invalid("max_attempts must be >= 1".to_string()));
        }
        if self.attempt_ttl_secs == 0 {
            return Err(PolicyError::Invalid("attempt_ttl_secs must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, PolicyError> {
        Ok(serde_yaml::to_string(self)?)
    }

    #[must_use]
    pub const fn attempt_ttl(&self) -> Duration {
        Duration::from_secs(self.attempt_ttl_secs)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub const fn escalation_for(&self, severity: Severity) -> EscalationAction {
        self.escalation.for_severity(severity)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid policy: {0}")]
    Invalid(String),
}
