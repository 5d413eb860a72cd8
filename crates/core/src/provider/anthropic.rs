//! Anthropic Messages API adapter. Differs from the OpenAI family in two
//! structural ways the builder must account for (spec §4.1): the system
//! prompt is a top-level field rather than a message with `role=system`,
//! and tool results are user-role content blocks rather than a dedicated
//! `tool` role.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use gateway_config::ProviderId;
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CallOptions, ChatCompletionStream, ParsedChunk, ParsedResponse, Provider, ToolCallDelta, http_client::http_client};
use crate::{
    domain::{ContentPart, LlmUsage, Message, ModelData, Role, Tool},
    error::{GatewayError, Result},
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: secrecy::SecretString,
}

impl AnthropicProvider {
    pub fn new(api_key: secrecy::SecretString, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn build_request(&self, messages: &[Message], options: &CallOptions, stream: bool) -> Value {
        let system: Vec<&Message> = messages.iter().filter(|m| matches!(m.role, Role::System | Role::Developer)).collect();
        let rest: Vec<&Message> = messages.iter().filter(|m| !matches!(m.role, Role::System | Role::Developer)).collect();

        let mut body = json!({
            "model": options.model,
            "max_tokens": options.max_output_tokens.unwrap_or(4096),
            "messages": rest.iter().map(|m| anthropic_message(m)).collect::<Vec<_>>(),
            "stream": stream,
        });

        let obj = body.as_object_mut().expect("object literal");

        if !system.is_empty() {
            let text = system.iter().map(|m| m.text_content()).collect::<Vec<_>>().join("\n\n");
            obj.insert("system".into(), json!(text));
        }
        if let Some(t) = options.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if !options.tools.is_empty() {
            obj.insert("tools".into(), json!(options.tools.iter().map(anthropic_tool).collect::<Vec<_>>()));
        }
        if let Some(budget) = options.reasoning_budget {
            obj.insert("thinking".into(), json!({"type": "enabled", "budget_tokens": budget}));
        }

        body
    }
}

fn anthropic_tool(tool: &Tool) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

fn anthropic_message(message: &Message) -> Value {
    let role = match message.role {
        Role::Assistant => "assistant",
        _ => "user",
    };

    let content: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::ToolCallRequest { id, tool_name, input, .. } => {
                json!({"type": "tool_use", "id": id, "name": tool_name, "input": input})
            }
            ContentPart::ToolCallResult { id, result, error } => json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": result.clone().unwrap_or_else(|| json!(error)),
                "is_error": error.is_some(),
            }),
            ContentPart::Reasoning { text } => json!({"type": "text", "text": text}),
            ContentPart::Object { value } => json!({"type": "text", "text": value.to_string()}),
            ContentPart::File { file } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": file.content_type.clone().unwrap_or_default(), "data": file.data.clone().unwrap_or_default()},
            }),
        })
        .collect();

    json!({"role": role, "content": content})
}

/// Mirrors the vendor's own forward-compatible enum shape: a named set of
/// known values plus an `Other(String)` catch-all for anything new the
/// vendor ships before this adapter is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Other,
}

impl StopReason {
    fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "tool_use" => StopReason::ToolUse,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

impl From<AnthropicUsage> for LlmUsage {
    fn from(usage: AnthropicUsage) -> Self {
        LlmUsage {
            prompt_tokens_total: usage.input_tokens,
            prompt_tokens_text: usage.input_tokens.saturating_sub(usage.cache_read_input_tokens),
            prompt_tokens_audio: 0,
            prompt_tokens_cached: usage.cache_read_input_tokens,
            completion_tokens_total: usage.output_tokens,
            completion_tokens_reasoning: 0,
            prompt_image_count: 0,
            completion_image_count: 0,
            prompt_audio_duration_seconds: None,
            cost_usd: None,
        }
    }
}

fn parse_response(response: AnthropicResponse) -> ParsedResponse {
    let stop_reason = response.stop_reason.as_deref().map(StopReason::parse);
    let mut content = Vec::new();
    let mut tool_call_index = 0;

    for block in response.content {
        match block {
            AnthropicContentBlock::Text { text } => content.push(ContentPart::Text { text }),
            AnthropicContentBlock::Thinking { thinking } => content.push(ContentPart::Reasoning { text: thinking }),
            AnthropicContentBlock::ToolUse { id, name, input } => {
                content.push(ContentPart::ToolCallRequest { id, tool_name: name, input, index: Some(tool_call_index) });
                tool_call_index += 1;
            }
            AnthropicContentBlock::Unknown => {}
        }
    }

    ParsedResponse {
        messages: vec![Message { role: Role::Assistant, content }],
        usage: response.usage.map(Into::into),
        finish_reason: stop_reason.map(|r| format!("{r:?}")),
    }
}

/// Anthropic's `invalid_request_error` body carries no structured `param`
/// the way OpenAI's does, so the schema/tool-choice and moderation cases
/// are told apart by the message text instead (spec §4.1 "Error
/// classification"; spec §8 property 4).
pub(super) fn classify_http_error(status: u16, body: &str) -> GatewayError {
    match status {
        429 => GatewayError::RateLimit(body.to_string()),
        401 | 403 => GatewayError::InvalidProviderConfig(body.to_string()),
        404 => GatewayError::MissingModel(body.to_string()),
        400 if body.contains("prompt is too long") => GatewayError::MaxTokensExceeded(body.to_string()),
        400 if body.contains("tool_choice") || body.contains("tool_use") || body.contains("input_schema") => {
            GatewayError::StructuredGenerationError(body.to_string())
        }
        400 if body.contains("content_policy") || body.contains("content policy") => GatewayError::ContentModeration(body.to_string()),
        400 => GatewayError::BadRequest(body.to_string()),
        529 | 500..=599 => GatewayError::ProviderInternalError(body.to_string()),
        _ => GatewayError::ProviderInternalError(body.to_string()),
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "claude-sonnet-4-5"
    }

    fn can_reference_files_by_url(&self) -> bool {
        false
    }

    fn is_streamable(&self, _model: &str, _tools: &[Tool]) -> bool {
        true
    }

    fn sanitize_model_data(&self, _model_data: &mut ModelData) {}

    async fn complete(&self, messages: &[Message], options: &CallOptions) -> Result<ParsedResponse> {
        let body = self.build_request(messages, options, false);

        let response = self
            .client
            .request(Method::POST, self.url())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| GatewayError::ProviderInternalError(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let parsed: AnthropicResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidGeneration(e.to_string()))?;

        Ok(parse_response(parsed))
    }

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<ChatCompletionStream> {
        let body = self.build_request(messages, options, true);

        let response = self
            .client
            .request(Method::POST, self.url())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = event_stream.filter_map(|event| async move {
            let event = event.ok()?;
            let raw: Value = serde_json::from_str(&event.data).ok()?;

            Some(Ok(anthropic_event_to_chunk(&raw)))
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn check_valid(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Anthropic's SSE stream emits differently-typed events
/// (`content_block_delta`, `message_delta`, ...) rather than one envelope
/// shape per chunk like OpenAI; dispatch on `type` instead of deserializing
/// a fixed struct.
fn anthropic_event_to_chunk(event: &Value) -> ParsedChunk {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

    match event_type {
        "content_block_delta" => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => ParsedChunk {
                    delta_text: delta.get("text").and_then(Value::as_str).map(str::to_string),
                    ..Default::default()
                },
                Some("thinking_delta") => ParsedChunk {
                    reasoning_delta: delta.get("thinking").and_then(Value::as_str).map(str::to_string),
                    ..Default::default()
                },
                Some("input_json_delta") => ParsedChunk {
                    tool_call_deltas: vec![ToolCallDelta {
                        id: None,
                        index: event.get("index").and_then(Value::as_u64).map(|i| i as u32),
                        tool_name: None,
                        arguments_fragment: delta.get("partial_json").and_then(Value::as_str).map(str::to_string),
                    }],
                    ..Default::default()
                },
                _ => ParsedChunk::default(),
            }
        }
        "content_block_start" => {
            let block = event.get("content_block").cloned().unwrap_or(Value::Null);
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                ParsedChunk {
                    tool_call_deltas: vec![ToolCallDelta {
                        id: block.get("id").and_then(Value::as_str).map(str::to_string),
                        index: event.get("index").and_then(Value::as_u64).map(|i| i as u32),
                        tool_name: block.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments_fragment: None,
                    }],
                    ..Default::default()
                }
            } else {
                ParsedChunk::default()
            }
        }
        "message_delta" => ParsedChunk {
            finish_reason: event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: event.get("usage").and_then(|u| serde_json::from_value::<AnthropicUsage>(u.clone()).ok()).map(Into::into),
            ..Default::default()
        },
        _ => ParsedChunk::default(),
    }
}
