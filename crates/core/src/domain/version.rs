//! `Version`: the full, hashable inference configuration (spec §3).

use gateway_config::ProviderId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{hash::content_hash, message::Message, tool::ToolChoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Disabled,
    Low,
    Medium,
    High,
}

/// Policy controlling automatic model fallback (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseFallback {
    Auto,
    Never,
    Models(Vec<String>),
}

impl Default for UseFallback {
    fn default() -> Self {
        UseFallback::Auto
    }
}

/// The complete, hashable configuration of an inference call. Two
/// `Version`s that would produce the same request share an id (spec §8
/// property 1); the id is derived from every field *except* itself, via
/// [`Version::with_id`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    #[serde(skip_serializing, default)]
    pub id: String,

    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    #[serde(default)]
    pub prompt: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_variables_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub structured_generation: bool,
    #[serde(default)]
    pub use_structured_generation: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,

    #[serde(default)]
    pub use_fallback: UseFallback,
}

impl Version {
    /// Compute and attach the content-hash id. Must be called after every
    /// field is final; `id` itself is excluded from the hash input via
    /// `#[serde(skip_serializing)]`.
    pub fn with_id(mut self) -> Self {
        self.id = content_hash(&self);
        self
    }

    pub fn has_output_schema(&self) -> bool {
        self.output_schema.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Role;

    fn base() -> Version {
        Version {
            id: String::new(),
            model: "gpt-4.1".into(),
            provider: None,
            temperature: Some(0.0),
            top_p: None,
            max_output_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            parallel_tool_calls: None,
            enabled_tools: vec![],
            tool_choice: None,
            prompt: vec![Message::text(Role::System, "be nice")],
            input_variables_schema: None,
            output_schema: None,
            structured_generation: false,
            use_structured_generation: false,
            reasoning_effort: None,
            reasoning_budget: None,
            use_fallback: UseFallback::Auto,
        }
        .with_id()
    }

    #[test]
    fn identical_versions_share_an_id() {
        assert_eq!(base().id, base().id);
    }

    #[test]
    fn changing_an_inference_parameter_changes_the_id() {
        let mut other = base();
        other.temperature = Some(0.5);
        let other = other.with_id();

        assert_ne!(base().id, other.id);
    }

    #[test]
    fn id_is_stable_across_field_declaration_order_equivalents() {
        // Two versions built with fields assigned in different order still
        // hash identically because canonicalisation sorts by key, not by
        // construction order.
        let a = base();
        let mut b = base();
        b.model = a.model.clone();
        assert_eq!(a.id, b.with_id().id);
    }
}
