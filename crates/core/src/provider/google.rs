//! Google Generative Language API adapter (Gemini). Structurally closer to
//! Anthropic than OpenAI: content is `parts` under `contents`, and the
//! vendor disallows a JSON mime type response once tools are attached
//! (spec §4.1 "Google disallows JSON mime when tools are present").

use async_trait::async_trait;
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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    client: Client,
    base_url: String,
    api_key: secrecy::SecretString,
}

impl GoogleProvider {
    pub fn new(api_key: secrecy::SecretString, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn url(&self, model: &str, stream: bool) -> String {
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        let alt = if stream { "&alt=sse" } else { "" };
        format!(
            "{}/models/{model}:{method}?key={}{alt}",
            self.base_url,
            self.api_key.expose_secret()
        )
    }

    fn build_request(&self, messages: &[Message], options: &CallOptions) -> Value {
        let system: Vec<&Message> = messages.iter().filter(|m| matches!(m.role, Role::System | Role::Developer)).collect();
        let rest: Vec<&Message> = messages.iter().filter(|m| !matches!(m.role, Role::System | Role::Developer)).collect();

        let mut body = json!({
            "contents": rest.iter().map(|m| google_content(m)).collect::<Vec<_>>(),
        });

        let obj = body.as_object_mut().expect("object literal");

        if !system.is_empty() {
            let text = system.iter().map(|m| m.text_content()).collect::<Vec<_>>().join("\n\n");
            obj.insert("systemInstruction".into(), json!({"parts": [{"text": text}]}));
        }

        let mut generation_config = serde_json::Map::new();

        if let Some(t) = options.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            generation_config.insert("topP".into(), json!(p));
        }
        if let Some(m) = options.max_output_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(m));
        }

        let tools_present = !options.tools.is_empty();

        // Google rejects `responseMimeType: application/json` once
        // function-calling tools are attached; fall back to plain text mode
        // for the model rather than letting the vendor 400 the call.
        if options.structured_generation && options.output_schema.is_some() && !tools_present {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
            generation_config.insert("responseSchema".into(), options.output_schema.clone().unwrap());
        }

        if !generation_config.is_empty() {
            obj.insert("generationConfig".into(), Value::Object(generation_config));
        }

        if tools_present {
            obj.insert(
                "tools".into(),
                json!([{"functionDeclarations": options.tools.iter().map(google_tool).collect::<Vec<_>>()}]),
            );
        }

        body
    }
}

fn google_tool(tool: &Tool) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.input_schema,
    })
}

fn google_content(message: &Message) -> Value {
    let role = match message.role {
        Role::Assistant => "model",
        _ => "user",
    };

    let parts: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"text": text}),
            ContentPart::ToolCallRequest { tool_name, input, .. } => json!({"functionCall": {"name": tool_name, "args": input}}),
            ContentPart::ToolCallResult { result, error, .. } => {
                json!({"functionResponse": {"response": result.clone().unwrap_or_else(|| json!({"error": error}))}})
            }
            ContentPart::Reasoning { text } => json!({"text": text}),
            ContentPart::Object { value } => json!({"text": value.to_string()}),
            ContentPart::File { file } => json!({
                "inlineData": {"mimeType": file.content_type.clone().unwrap_or_default(), "data": file.data.clone().unwrap_or_default()},
            }),
        })
        .collect();

    json!({"role": role, "parts": parts})
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    candidates: Vec<GoogleCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage: Option<GoogleUsage>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum GooglePart {
    #[serde(rename_all = "camelCase")]
    FunctionCall { function_call: GoogleFunctionCall },
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct GoogleFunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsage {
    prompt_token_count: u32,
    candidates_token_count: u32,
    #[serde(default)]
    cached_content_token_count: u32,
    #[serde(default)]
    thoughts_token_count: u32,
}

impl From<GoogleUsage> for LlmUsage {
    fn from(usage: GoogleUsage) -> Self {
        LlmUsage {
            prompt_tokens_total: usage.prompt_token_count,
            prompt_tokens_text: usage.prompt_token_count.saturating_sub(usage.cached_content_token_count),
            prompt_tokens_audio: 0,
            prompt_tokens_cached: usage.cached_content_token_count,
            completion_tokens_total: usage.candidates_token_count,
            completion_tokens_reasoning: usage.thoughts_token_count,
            prompt_image_count: 0,
            completion_image_count: 0,
            prompt_audio_duration_seconds: None,
            cost_usd: None,
        }
    }
}

fn parse_response(response: GoogleResponse) -> ParsedResponse {
    let candidate = response.candidates.into_iter().next();
    let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());

    let mut content = Vec::new();
    let mut tool_call_index = 0;

    for part in candidate.map(|c| c.content.parts).unwrap_or_default() {
        match part {
            GooglePart::Text { text } => content.push(ContentPart::Text { text }),
            GooglePart::FunctionCall { function_call } => {
                content.push(ContentPart::ToolCallRequest {
                    id: format!("call_{tool_call_index}"),
                    tool_name: function_call.name,
                    input: function_call.args,
                    index: Some(tool_call_index),
                });
                tool_call_index += 1;
            }
        }
    }

    ParsedResponse {
        messages: vec![Message { role: Role::Assistant, content }],
        usage: response.usage.map(Into::into),
        finish_reason,
    }
}

pub(super) fn classify_http_error(status: u16, body: &str) -> GatewayError {
    match status {
        429 => GatewayError::RateLimit(body.to_string()),
        401 | 403 => GatewayError::InvalidProviderConfig(body.to_string()),
        404 => GatewayError::MissingModel(body.to_string()),
        400 if body.contains("token count") => GatewayError::MaxTokensExceeded(body.to_string()),
        400 if body.contains("responseSchema") || body.contains("response_schema") => {
            GatewayError::StructuredGenerationError(body.to_string())
        }
        400 if body.contains("SAFETY") || body.contains("blocked") => GatewayError::ContentModeration(body.to_string()),
        400 => GatewayError::BadRequest(body.to_string()),
        500..=599 => GatewayError::ProviderInternalError(body.to_string()),
        _ => GatewayError::ProviderInternalError(body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_response_schema_as_structured_generation_error() {
        let body = r#"{"error":{"code":400,"message":"Invalid value at 'generation_config.response_schema'","status":"INVALID_ARGUMENT"}}"#;
        let error = classify_http_error(400, body);
        assert!(matches!(error, GatewayError::StructuredGenerationError(_)));
    }

    #[test]
    fn classifies_safety_block_as_content_moderation() {
        let body = r#"{"error":{"code":400,"message":"The response was blocked due to SAFETY","status":"INVALID_ARGUMENT"}}"#;
        let error = classify_http_error(400, body);
        assert!(matches!(error, GatewayError::ContentModeration(_)));
    }

    #[test]
    fn classifies_token_count_error_as_max_tokens_exceeded() {
        let error = classify_http_error(400, "input token count exceeds the maximum");
        assert!(matches!(error, GatewayError::MaxTokensExceeded(_)));
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "gemini-2.5-flash"
    }

    fn can_reference_files_by_url(&self) -> bool {
        false
    }

    fn is_streamable(&self, _model: &str, _tools: &[Tool]) -> bool {
        true
    }

    fn sanitize_model_data(&self, model_data: &mut ModelData) {
        // Structured output and tool calling can't be requested together,
        // so don't advertise both as independently available.
        if model_data.supports.tool_calling {
            model_data.supports.structured_output = false;
        }
    }

    async fn complete(&self, messages: &[Message], options: &CallOptions) -> Result<ParsedResponse> {
        let body = self.build_request(messages, options);

        let response = self
            .client
            .request(Method::POST, self.url(&options.model, false))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| GatewayError::ProviderInternalError(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let parsed: GoogleResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::InvalidGeneration(e.to_string()))?;

        Ok(parse_response(parsed))
    }

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<ChatCompletionStream> {
        let body = self.build_request(messages, options);

        let response = self
            .client
            .request(Method::POST, self.url(&options.model, true))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &text));
        }

        use eventsource_stream::Eventsource;

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = event_stream.filter_map(|event| async move {
            let event = event.ok()?;
            let parsed: GoogleResponse = serde_json::from_str(&event.data).ok()?;
            let full = parse_response(parsed);

            let delta_text = full.messages.first().and_then(|m| m.content.first()).and_then(ContentPart::as_text).map(str::to_string);

            let tool_call_deltas = full
                .messages
                .first()
                .map(|m| {
                    m.tool_call_requests()
                        .enumerate()
                        .map(|(i, (id, name, input))| ToolCallDelta {
                            id: Some(id.to_string()),
                            index: Some(i as u32),
                            tool_name: Some(name.to_string()),
                            arguments_fragment: Some(input.to_string()),
                        })
                        .collect()
                })
                .unwrap_or_default();

            Some(Ok(ParsedChunk {
                delta_text,
                reasoning_delta: None,
                tool_call_deltas,
                usage: full.usage,
                finish_reason: full.finish_reason,
            }))
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn check_valid(&self) -> bool {
        self.client
            .get(format!("{}/models?key={}", self.base_url, self.api_key.expose_secret()))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
