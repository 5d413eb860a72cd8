//! The `Provider` trait: one implementation per upstream vendor. Every
//! adapter translates between [`crate::domain`] types and that vendor's
//! wire format; nothing above this layer ever touches a vendor schema
//! directly (spec §4.1).

pub mod http_client;

mod anthropic;
mod bedrock;
mod google;
mod openai;
mod openai_compatible;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use gateway_config::ProviderId;

use crate::{
    domain::{File, FileFormat, Message, ModelData, Tool, ToolChoice},
    error::Result,
};

/// Inference parameters the pipeline has already resolved for this attempt:
/// model name, sampling/penalty knobs, tools, output schema, deadline. Kept
/// separate from `Vec<Message>` because adapters need to branch on several
/// of these fields (e.g. `output_schema.is_some()`) before they ever touch
/// message content.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub parallel_tool_calls: Option<bool>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub output_schema: Option<serde_json::Value>,
    pub structured_generation: bool,
    pub reasoning_effort: Option<crate::domain::ReasoningEffort>,
    pub reasoning_budget: Option<u32>,
    pub stream: bool,
}

/// One parsed increment of a streaming completion (spec §4.1: "delta text,
/// reasoning delta, zero or more tool-call deltas ... optional usage,
/// optional finish reason").
#[derive(Debug, Clone, Default)]
pub struct ParsedChunk {
    pub delta_text: Option<String>,
    pub reasoning_delta: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub usage: Option<crate::domain::LlmUsage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub index: Option<u32>,
    pub tool_name: Option<String>,
    pub arguments_fragment: Option<String>,
}

/// A fully-parsed, non-streaming completion.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub messages: Vec<Message>,
    pub usage: Option<crate::domain::LlmUsage>,
    pub finish_reason: Option<String>,
}

pub type ChatCompletionStream = Pin<Box<dyn Stream<Item = Result<ParsedChunk>> + Send>>;

/// One upstream vendor's adapter (spec §4.1). Adapter instances are
/// short-lived per call; any state they hold (an HTTP client, a resolved
/// base URL) is cheap, read-only configuration.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Whether this adapter can serve `model` at all, independent of the
    /// catalog entry (e.g. a configured model-name alias).
    fn supports_model(&self, model: &str) -> bool;

    fn default_model(&self) -> &str;

    /// Whether `file` must be downloaded to bytes before this adapter can
    /// consume it for `model`, rather than being passed through by URL
    /// (spec §3 `File::requires_downloading`, applied per-vendor).
    fn requires_downloading_file(&self, file: &File, model: &str) -> bool {
        file.requires_downloading(self.can_reference_files_by_url())
    }

    fn can_reference_files_by_url(&self) -> bool {
        false
    }

    /// Whether `model` can be called in streaming mode given `tools`; some
    /// vendors disable streaming once tool calling is active for a model
    /// (spec §4.1 `is_streamable`).
    fn is_streamable(&self, model: &str, tools: &[Tool]) -> bool;

    /// In-place adjustments to a catalog entry before the pipeline uses it
    /// for this attempt, e.g. forcing `structured_output` off for a model
    /// that only claims partial support (spec §4.1 `sanitize_model_data`).
    fn sanitize_model_data(&self, model_data: &mut ModelData);

    async fn complete(&self, messages: &[Message], options: &CallOptions) -> Result<ParsedResponse>;

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<ChatCompletionStream>;

    /// Lightweight credential ping, used by health/readiness checks rather
    /// than by the inference path itself.
    async fn check_valid(&self) -> bool;

    fn supports_modality(&self, format: FileFormat) -> bool {
        matches!(format, FileFormat::Document)
    }
}
