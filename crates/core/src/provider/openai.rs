//! OpenAI chat-completions adapter. Also the base request/response shape
//! reused by [`super::openai_compatible`] for Mistral, Fireworks, Groq and
//! Azure OpenAI, which all speak the same wire protocol with small
//! deviations.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use gateway_config::ProviderId;
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{CallOptions, ChatCompletionStream, ParsedChunk, ParsedResponse, Provider, ToolCallDelta, http_client::http_client};
use crate::{
    domain::{ContentPart, LlmUsage, Message, ModelData, Role, Tool},
    error::{GatewayError, Result},
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: secrecy::SecretString,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: secrecy::SecretString, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            default_model: "gpt-4.1".to_string(),
        }
    }

    /// Build the vendor request body (spec §4.1 step 1). System messages
    /// are passed through as-is: OpenAI supports `system`/`developer` roles
    /// natively, unlike vendors this base is reused for via
    /// [`super::openai_compatible`].
    fn build_request(&self, messages: &[Message], options: &CallOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": messages.iter().map(openai_message).collect::<Vec<_>>(),
            "stream": stream,
        });

        let obj = body.as_object_mut().expect("object literal");

        if let Some(t) = options.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(m) = options.max_output_tokens {
            obj.insert("max_completion_tokens".into(), json!(m));
        }
        if let Some(p) = options.presence_penalty {
            obj.insert("presence_penalty".into(), json!(p));
        }
        if let Some(p) = options.frequency_penalty {
            obj.insert("frequency_penalty".into(), json!(p));
        }
        if let Some(p) = options.parallel_tool_calls {
            obj.insert("parallel_tool_calls".into(), json!(p));
        }
        if !options.tools.is_empty() {
            obj.insert("tools".into(), json!(options.tools.iter().map(openai_tool).collect::<Vec<_>>()));
        }
        if let Some(schema) = &options.output_schema
            && options.structured_generation
        {
            obj.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": "output", "strict": true, "schema": schema},
                }),
            );
        }
        if let Some(effort) = options.reasoning_effort {
            obj.insert("reasoning_effort".into(), json!(reasoning_effort_str(effort)));
        }

        body
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

pub(super) fn reasoning_effort_str(effort: crate::domain::ReasoningEffort) -> &'static str {
    use crate::domain::ReasoningEffort::*;
    match effort {
        Disabled => "none",
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

pub(super) fn openai_tool(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
            "strict": tool.strict,
        }
    })
}

pub(super) fn openai_message(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Developer => "developer",
        Role::Tool => "tool",
    };

    let text = message.text_content();
    let mut out = json!({"role": role, "content": text});

    let tool_calls: Vec<Value> = message
        .tool_call_requests()
        .map(|(id, name, input)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })
        })
        .collect();

    if !tool_calls.is_empty() {
        out["tool_calls"] = json!(tool_calls);
    }

    out
}

#[derive(Debug, Deserialize)]
pub(super) struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptTokenDetails>,
    #[serde(default)]
    completion_tokens_details: Option<OpenAiCompletionTokenDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiPromptTokenDetails {
    #[serde(default)]
    cached_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiCompletionTokenDetails {
    #[serde(default)]
    reasoning_tokens: u32,
}

impl From<OpenAiUsage> for LlmUsage {
    fn from(usage: OpenAiUsage) -> Self {
        let cached = usage.prompt_tokens_details.unwrap_or_default().cached_tokens;
        let reasoning = usage.completion_tokens_details.unwrap_or_default().reasoning_tokens;

        LlmUsage {
            prompt_tokens_total: usage.prompt_tokens,
            prompt_tokens_text: usage.prompt_tokens.saturating_sub(cached),
            prompt_tokens_audio: 0,
            prompt_tokens_cached: cached,
            completion_tokens_total: usage.completion_tokens,
            completion_tokens_reasoning: reasoning,
            prompt_image_count: 0,
            completion_image_count: 0,
            prompt_audio_duration_seconds: None,
            cost_usd: None,
        }
    }
}

pub(super) fn parse_response(response: OpenAiResponse) -> ParsedResponse {
    let finish_reason = response.choices.first().and_then(|c| c.finish_reason.clone());

    let messages = response
        .choices
        .into_iter()
        .map(|choice| {
            let mut content = Vec::new();

            if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
                content.push(ContentPart::Text { text });
            }

            for (index, call) in choice.message.tool_calls.into_iter().enumerate() {
                content.push(ContentPart::ToolCallRequest {
                    id: call.id,
                    tool_name: call.function.name,
                    input: serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null),
                    index: Some(index as u32),
                });
            }

            Message { role: Role::Assistant, content }
        })
        .collect();

    ParsedResponse {
        messages,
        usage: response.usage.map(Into::into),
        finish_reason,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    param: Option<String>,
    code: Option<String>,
}

/// Classify a non-2xx OpenAI response into the canonical taxonomy (spec §4.1
/// "Error classification"). `invalid_request_error`s naming the schema or
/// `response_format` param are the structured-generation failures spec §8
/// property 4 retries once with structured generation off; ones flagged by
/// moderation are surfaced separately so they never get retried.
pub(super) fn classify_http_error(status: u16, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<OpenAiErrorBody>(body).ok().map(|b| b.error);

    match status {
        429 => GatewayError::RateLimit(body.to_string()),
        401 | 403 => GatewayError::InvalidProviderConfig(body.to_string()),
        404 => GatewayError::MissingModel(body.to_string()),
        400 if detail.as_ref().is_some_and(|d| {
            d.kind.as_deref() == Some("invalid_request_error") && d.param.as_deref().is_some_and(|p| p.contains("response_format") || p.contains("schema"))
        }) =>
        {
            GatewayError::StructuredGenerationError(detail.unwrap().message)
        }
        // A model that plainly doesn't support function calling at all, as
        // opposed to a malformed schema for one it does support (spec §4.1
        // "Unsupported parameter tools ... ModelDoesNotSupportMode").
        400 if detail
            .as_ref()
            .is_some_and(|d| d.kind.as_deref() == Some("invalid_request_error") && d.param.as_deref().is_some_and(|p| p.contains("tools") || p.contains("tool_choice"))) =>
        {
            GatewayError::ModelDoesNotSupportMode(detail.unwrap().message)
        }
        400 if detail
            .as_ref()
            .is_some_and(|d| d.code.as_deref() == Some("content_filter") || d.kind.as_deref() == Some("content_filter")) =>
        {
            GatewayError::ContentModeration(detail.unwrap().message)
        }
        400 if body.contains("context_length") || body.contains("maximum context length") => {
            GatewayError::MaxTokensExceeded(body.to_string())
        }
        400 => GatewayError::BadRequest(body.to_string()),
        408 => GatewayError::ReadTimeout(body.to_string()),
        500..=599 => GatewayError::ProviderInternalError(body.to_string()),
        _ => GatewayError::ProviderInternalError(body.to_string()),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn can_reference_files_by_url(&self) -> bool {
        true
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
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| GatewayError::ProviderInternalError(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let parsed: OpenAiResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidGeneration(e.to_string()))?;

        Ok(parse_response(parsed))
    }

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<ChatCompletionStream> {
        let body = self.build_request(messages, options, true);

        let response = self
            .client
            .request(Method::POST, self.url())
            .bearer_auth(self.api_key.expose_secret())
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
            let event = match event {
                Ok(event) => event,
                Err(_) => return None,
            };

            if event.data == "[DONE]" {
                return None;
            }

            let chunk: OpenAiStreamChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(_) => return None,
            };

            Some(Ok(chunk.into_parsed_chunk()))
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn check_valid(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiStreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamFunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl OpenAiStreamChunk {
    pub(super) fn into_parsed_chunk(self) -> ParsedChunk {
        let choice = self.choices.into_iter().next();

        let tool_call_deltas = choice
            .as_ref()
            .map(|c| {
                c.delta
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallDelta {
                        id: call.id.clone(),
                        index: Some(call.index),
                        tool_name: call.function.as_ref().and_then(|f| f.name.clone()),
                        arguments_fragment: call.function.as_ref().and_then(|f| f.arguments.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ParsedChunk {
            delta_text: choice.as_ref().and_then(|c| c.delta.content.clone()),
            reasoning_delta: None,
            tool_call_deltas,
            usage: self.usage.map(Into::into),
            finish_reason: choice.and_then(|c| c.finish_reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_as_retryable() {
        let error = classify_http_error(429, "too many requests");
        assert!(error.policy().retry);
    }

    #[test]
    fn classifies_context_length_error_from_message_body() {
        let error = classify_http_error(400, "This model's maximum context length is 128000 tokens");
        assert!(matches!(error, GatewayError::MaxTokensExceeded(_)));
    }

    #[test]
    fn classifies_response_format_invalid_request_as_structured_generation_error() {
        let body = r#"{"error":{"message":"Invalid schema","type":"invalid_request_error","param":"response_format","code":null}}"#;
        let error = classify_http_error(400, body);
        assert!(matches!(error, GatewayError::StructuredGenerationError(_)));
    }

    #[test]
    fn classifies_content_filter_error_as_content_moderation() {
        let body = r#"{"error":{"message":"flagged by moderation","type":"invalid_request_error","param":null,"code":"content_filter"}}"#;
        let error = classify_http_error(400, body);
        assert!(matches!(error, GatewayError::ContentModeration(_)));
    }

    #[test]
    fn classifies_rejected_tools_param_as_model_does_not_support_mode() {
        let body = r#"{"error":{"message":"This model does not support function calling","type":"invalid_request_error","param":"tools","code":null}}"#;
        let error = classify_http_error(400, body);
        assert!(matches!(error, GatewayError::ModelDoesNotSupportMode(_)));
    }

    #[test]
    fn builds_system_and_user_messages_with_native_roles() {
        let provider = OpenAiProvider::new(secrecy::SecretString::from("sk-test"), None);
        let options = CallOptions {
            model: "gpt-4.1".into(),
            temperature: Some(0.0),
            top_p: None,
            max_output_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            parallel_tool_calls: None,
            tools: vec![],
            tool_choice: None,
            output_schema: None,
            structured_generation: false,
            reasoning_effort: None,
            reasoning_budget: None,
            stream: false,
        };

        let messages = vec![Message::text(Role::System, "be nice"), Message::text(Role::User, "hi")];
        let body = provider.build_request(&messages, &options, false);

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
    }
}
