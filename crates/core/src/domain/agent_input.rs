use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{hash::content_hash, message::Message};

/// One input to render against a `Version`'s prompt template (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    #[serde(skip_serializing, default)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

impl AgentInput {
    pub fn with_id(mut self) -> Self {
        self.id = content_hash(&self);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.as_ref().is_none_or(Vec::is_empty) && self.variables.is_none()
    }
}
