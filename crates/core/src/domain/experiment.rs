use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{agent_completion::AgentCompletion, agent_input::AgentInput, version::Version};

/// Playground cache policy (spec §4.5 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    Auto,
    Always,
    Never,
}

impl CachePolicy {
    /// Whether a `(version, input)` pair is eligible for the completion
    /// cache under this policy (spec §4.5 step 5: "`auto` caches only when
    /// temperature == 0 and no tools").
    pub fn allows_cache(&self, version: &Version) -> bool {
        match self {
            CachePolicy::Always => true,
            CachePolicy::Never => false,
            CachePolicy::Auto => version.temperature.unwrap_or(1.0) == 0.0 && version.enabled_tools.is_empty(),
        }
    }
}

/// A set of `(version x input)` completions run together (spec §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub metadata: serde_json::Value,
    pub cache_policy: CachePolicy,
    pub inputs: BTreeMap<String, AgentInput>,
    pub versions: BTreeMap<String, Version>,
    /// Keyed by `(version_id, input_id)`.
    pub completions: BTreeMap<(String, String), ExperimentCompletionState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExperimentCompletionState {
    Pending,
    Running,
    Completed(Box<AgentCompletion>),
    Failed(crate::error::GatewayError),
}

impl ExperimentCompletionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentCompletionState::Completed(_) | ExperimentCompletionState::Failed(_))
    }
}

impl Experiment {
    pub fn add_input(&mut self, input: AgentInput) -> String {
        let id = input.id.clone();
        self.inputs.entry(id.clone()).or_insert(input);
        id
    }

    pub fn add_version(&mut self, version: Version) -> String {
        let id = version.id.clone();
        self.versions.entry(id.clone()).or_insert(version);
        id
    }

    pub fn all_terminal(&self) -> bool {
        !self.completions.is_empty() && self.completions.values().all(ExperimentCompletionState::is_terminal)
    }
}
