use gateway_config::ProviderId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{message::Message, version::Version};
use crate::error::GatewayError;

/// Token/media usage for one LLM call, ahead of cost computation (spec §3
/// "LLMUsage").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens_total: u32,
    pub prompt_tokens_text: u32,
    pub prompt_tokens_audio: u32,
    pub prompt_tokens_cached: u32,
    pub completion_tokens_total: u32,
    pub completion_tokens_reasoning: u32,
    pub prompt_image_count: u32,
    pub completion_image_count: u32,
    pub prompt_audio_duration_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
}

/// One provider HTTP call made while servicing a request, including
/// whatever error it produced (spec §3 "LLMCompletion trace").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompletionTrace {
    pub messages_sent: Vec<Message>,
    pub model: String,
    pub provider: ProviderId,
    /// Label identifying which configured credential was used, for
    /// debugging round-robin/custom-config attempts.
    pub config_reference: String,
    pub duration_ms: u64,
    pub usage: Option<LlmUsage>,
    pub error: Option<GatewayError>,
    pub provider_request_incurs_cost: bool,
}

/// Result of a fully-processed inference request (spec §3
/// "AgentCompletion"). Created at request start, mutated only by its owning
/// runner task, emitted exactly once whether it succeeds or fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCompletion {
    pub id: Uuid,
    pub agent_id: String,
    pub version: Version,
    pub input_id: String,
    pub output: CompletionOutput,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub traces: Vec<LlmCompletionTrace>,
    pub conversation_id: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionOutput {
    Success { messages: Vec<Message> },
    Error { error: GatewayError },
}

impl AgentCompletion {
    /// UUID-v7 ids are time-sortable and their embedded timestamp is
    /// authoritative for `created_at` (spec §6.3).
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }
}
