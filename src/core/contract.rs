//! Agent contract: what producers may say and where they may write.
//!
//! Loaded from `.roadmap/contract.yaml`; built-in defaults apply when the
//! file is absent.

use crate::core::boundary::KindBoundary;
use crate::core::events::Action;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Envelope fields only the orchestrator may set.
pub const DEFAULT_FORBIDDEN_FIELDS: [&str; 9] = [
    "schema_version",
    "event_id",
    "event_seq",
    "ts",
    "actor",
    "payload",
    "assigned_to",
    "started_at",
    "completed_at",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub allowed_agent_actions: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            allowed_agent_actions: Action::ALL
                .into_iter()
                .filter(|a| a.is_producer_action())
                .map(|a| a.as_str().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputContract {
    pub forbidden_fields: Vec<String>,
}

impl Default for OutputContract {
    fn default() -> Self {
        Self {
            forbidden_fields: DEFAULT_FORBIDDEN_FIELDS.map(str::to_string).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchScope {
    pub enabled: bool,
}

impl Default for PatchScope {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    #[serde(default)]
    pub patch_scope: PatchScope,
    pub by_task_kind: BTreeMap<String, KindBoundary>,
}

impl Default for Boundaries {
    fn default() -> Self {
        let read_all = ["docs/", "src/", "tests/", ".roadmap/roadmap.json"];
        let by_task_kind = BTreeMap::from([
            (
                "spec".to_string(),
                KindBoundary::new(["docs/spec/"])
                    .with_read(read_all)
                    .forbid(".roadmap/"),
            ),
            (
                "impl".to_string(),
                KindBoundary::new(["src/", "tests/"])
                    .with_read(read_all)
                    .forbid(".roadmap/"),
            ),
            (
                "qa".to_string(),
                KindBoundary::new(["docs/qa/", "tests/"])
                    .with_read(read_all)
                    .forbid(".roadmap/"),
            ),
        ]);
        Self {
            patch_scope: PatchScope::default(),
            by_task_kind,
        }
    }
}

/// The full agent contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContract {
    #[serde(default)]
    pub vocabulary: Vocabulary,
    #[serde(default)]
    pub output_contract: OutputContract,
    #[serde(default)]
    pub boundaries: Boundaries,
}

impl AgentContract {
    /// Loads the contract, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn to_yaml(&self) -> Result<String, ContractError> {
        Ok(serde_yaml::to_string(self)?)
    }

    #[must_use]
    pub fn allows_agent_action(&self, action: Action) -> bool {
        action.is_producer_action()
            && self
                .vocabulary
                .allowed_agent_actions
                .iter()
                .any(|a| a == action.as_str())
    }

    /// Orchestrator-assigned fields are always forbidden; the contract can
    /// only extend the list.
    #[must_use]
    pub fn is_forbidden_field(&self, field: &str) -> bool {
        DEFAULT_FORBIDDEN_FIELDS.contains(&field)
            || self
                .output_contract
                .forbidden_fields
                .iter()
                .any(|f| f == field)
    }

    #[must_use]
    pub fn boundary_for(&self, kind: &str) -> Option<&KindBoundary> {
        self.boundaries.by_task_kind.get(kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("failed to read contract: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid contract YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_contract_allows_only_producer_actions() {
        let contract = AgentContract::default();
        assert!(contract.allows_agent_action(Action::Claim));
        assert!(contract.allows_agent_action(Action::IssueReport));
        assert!(!contract.allows_agent_action(Action::IssueResolve));
        assert!(!contract.allows_agent_action(Action::RunStart));
        assert!(contract.is_forbidden_field("event_seq"));
        assert!(!contract.is_forbidden_field("notes"));
    }

    #[test]
    fn listing_a_reserved_action_does_not_grant_it() {
        let mut contract = AgentContract::default();
        contract
            .vocabulary
            .allowed_agent_actions
            .push("task.create".to_string());
        assert!(!contract.allows_agent_action(Action::TaskCreate));
    }

    #[test]
    fn clearing_forbidden_fields_keeps_the_builtin_list() {
        let mut contract = AgentContract::default();
        contract.output_contract.forbidden_fields.clear();
        assert!(contract.is_forbidden_field("event_seq"));
        assert!(contract.is_forbidden_field("assigned_to"));

        contract
            .output_contract
            .forbidden_fields
            .push("owner".to_string());
        assert!(contract.is_forbidden_field("owner"));
        assert!(!contract.is_forbidden_field("notes"));
    }

    #[test]
    fn yaml_round_trip_and_partial_documents() {
        let contract = AgentContract::default();
        let yaml = contract.to_yaml().unwrap();
        let restored: AgentContract = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, contract);

        let partial = "boundaries:\n  by_task_kind:\n    docs:\n      write: [\"docs/\"]\n";
        let contract: AgentContract = serde_yaml::from_str(partial).unwrap();
        assert!(contract.boundary_for("docs").is_some());
        assert!(contract.boundary_for("impl").is_none());
        assert!(contract.boundaries.patch_scope.enabled);
        assert_eq!(contract.output_contract.forbidden_fields.len(), 9);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let contract = AgentContract::load(&dir.path().join("contract.yaml")).unwrap();
        assert_eq!(contract, AgentContract::default());
    }
}
