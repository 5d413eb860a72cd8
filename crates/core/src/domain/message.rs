//! Neutral message representation (spec §3 "Message"). Every provider
//! adapter translates to and from this shape; nothing in the pipeline or
//! runner touches a vendor-specific wire type directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::file::File;

/// Who sent a message. `Developer` is OpenAI's stronger-than-`System`
/// instruction role; adapters that don't distinguish the two fold
/// `Developer` into `System` on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Developer,
    Tool,
}

/// One part of a message's content. Invariant (spec §3): a part is *exactly
/// one* of these kinds, enforced here by using an enum rather than a struct
/// with optional fields for every kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// A structured (non-text) object, e.g. a parsed JSON payload echoed
    /// back into the conversation.
    Object { value: Value },
    File { file: File },
    ToolCallRequest {
        id: String,
        tool_name: String,
        input: Value,
        index: Option<u32>,
    },
    ToolCallResult {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Reasoning { text: String },
}

impl ContentPart {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_call_request(&self) -> bool {
        matches!(self, ContentPart::ToolCallRequest { .. })
    }
}

/// A single message in a conversation, consisting of a role and an ordered
/// sequence of content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenate every text part, ignoring non-text content. Used by
    /// providers that only support a flat string per message and by the
    /// output-validation step to recover the raw generated text.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_call_requests(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCallRequest { id, tool_name, input, .. } => Some((id.as_str(), tool_name.as_str(), input)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let message = Message {
            role: Role::User,
            content: vec![
                ContentPart::Text { text: "hi".into() },
                ContentPart::ToolCallRequest {
                    id: "call_1".into(),
                    tool_name: "search".into(),
                    input: serde_json::json!({"q": "rust"}),
                    index: Some(0),
                },
            ],
        };

        let json = serde_json::to_string(&message).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.text_content(), "hi");
        assert_eq!(parsed.tool_call_requests().count(), 1);
    }
}
