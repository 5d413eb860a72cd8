use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool (function) the model may call. Names prefixed `@` are hosted
/// tools the runner executes locally rather than surfacing to the caller
/// (spec glossary: "Hosted tool").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub strict: bool,
}

impl Tool {
    pub fn is_hosted(&self) -> bool {
        self.name.starts_with('@')
    }
}

/// Controls whether and how the model must use tools (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    Function { name: String },
}

impl Default for ToolChoice {
    fn default() -> Self {
        ToolChoice::Auto
    }
}

/// A tool call the model requested, as recorded on an `AgentCompletion`'s
/// trace. Distinct from [`crate::domain::message::ContentPart::ToolCallRequest`]
/// in that it's a free-standing record rather than embedded message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}
