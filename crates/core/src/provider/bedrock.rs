//! Amazon Bedrock adapter using the vendor-neutral Converse API, which
//! covers Anthropic, Amazon, Meta, Mistral and Cohere foundation models
//! behind one wire shape (spec §4.1, §6.4 "Bedrock: access key/secret/
//! session token plus region").

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_bedrockruntime::{
    Client,
    error::ProvideErrorMetadata,
    types::{
        ContentBlock, ConversationRole, InferenceConfiguration, Message as BedrockMessage, SystemContentBlock, Tool as BedrockTool,
        ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolSpec, ToolUseBlock,
    },
};
use aws_smithy_types::Document;
use futures::stream;
use gateway_config::ProviderId;

use super::{CallOptions, ChatCompletionStream, ParsedChunk, ParsedResponse, Provider};
use crate::{
    domain::{ContentPart, LlmUsage, Message, ModelData, Role, Tool},
    error::{GatewayError, Result},
};

pub struct BedrockProvider {
    client: Client,
}

impl BedrockProvider {
    pub async fn new(access_key_id: String, secret_access_key: String, session_token: Option<String>, region: String) -> Self {
        let credentials = Credentials::new(access_key_id, secret_access_key, session_token, None, "gateway-config");

        let sdk_config = aws_config::from_env()
            .region(Region::new(region))
            .credentials_provider(credentials)
            .load()
            .await;

        Self { client: Client::new(&sdk_config) }
    }
}

fn json_to_document(value: &serde_json::Value) -> Document {
    match value {
        serde_json::Value::Null => Document::Null,
        serde_json::Value::Bool(b) => Document::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Document::Number)
            .map(|d| Document::Number(aws_smithy_types::Number::Float(d.into())))
            .unwrap_or(Document::Null),
        serde_json::Value::String(s) => Document::String(s.clone()),
        serde_json::Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        serde_json::Value::Object(map) => {
            Document::Object(map.iter().map(|(k, v)| (k.clone(), json_to_document(v))).collect())
        }
    }
}

fn document_to_json(doc: &Document) -> serde_json::Value {
    match doc {
        Document::Null => serde_json::Value::Null,
        Document::Bool(b) => serde_json::Value::Bool(*b),
        Document::Number(n) => serde_json::json!(n.to_f64_lossy()),
        Document::String(s) => serde_json::Value::String(s.clone()),
        Document::Array(items) => serde_json::Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => {
            serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), document_to_json(v))).collect())
        }
    }
}

fn to_bedrock_message(message: &Message) -> Option<BedrockMessage> {
    let role = match message.role {
        Role::Assistant => ConversationRole::Assistant,
        Role::System | Role::Developer => return None,
        _ => ConversationRole::User,
    };

    let blocks: Vec<ContentBlock> = message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(ContentBlock::Text(text.clone())),
            ContentPart::ToolCallRequest { id, tool_name, input, .. } => Some(ContentBlock::ToolUse(
                ToolUseBlock::builder()
                    .tool_use_id(id)
                    .name(tool_name)
                    .input(json_to_document(input))
                    .build()
                    .expect("required fields set"),
            )),
            ContentPart::ToolCallResult { id, result, error } => {
                let content = result.as_ref().map(|v| ToolResultContentBlock::Json(json_to_document(v))).unwrap_or_else(|| {
                    ToolResultContentBlock::Text(error.clone().unwrap_or_default())
                });

                Some(ContentBlock::ToolResult(
                    ToolResultBlock::builder().tool_use_id(id).content(content).build().expect("required fields set"),
                ))
            }
            ContentPart::Reasoning { text } => Some(ContentBlock::Text(text.clone())),
            ContentPart::Object { value } => Some(ContentBlock::Text(value.to_string())),
            ContentPart::File { .. } => None,
        })
        .collect();

    if blocks.is_empty() {
        return None;
    }

    BedrockMessage::builder().role(role).set_content(Some(blocks)).build().ok()
}

fn to_bedrock_tool(tool: &Tool) -> BedrockTool {
    let schema = ToolInputSchema::Json(json_to_document(&tool.input_schema));

    BedrockTool::ToolSpec(
        ToolSpec::builder()
            .name(&tool.name)
            .set_description(tool.description.clone())
            .input_schema(schema)
            .build()
            .expect("required fields set"),
    )
}

pub(super) fn handle_bedrock_error(error: impl ProvideErrorMetadata) -> GatewayError {
    let code = error.code().unwrap_or("Unknown").to_string();
    let message = error.message().unwrap_or("unknown Bedrock error").to_string();

    classify_bedrock_code(&code, &message)
}

fn classify_bedrock_code(code: &str, message: &str) -> GatewayError {
    match code {
        "ThrottlingException" | "ServiceQuotaExceededException" => GatewayError::RateLimit(message.to_string()),
        "ValidationException" if message.contains("too long") => GatewayError::MaxTokensExceeded(message.to_string()),
        "ValidationException" if message.contains("toolConfig") || message.contains("tool_choice") || message.contains("JSON schema") => {
            GatewayError::StructuredGenerationError(message.to_string())
        }
        "ValidationException" if message.contains("guardrail") || message.contains("content policy") => {
            GatewayError::ContentModeration(message.to_string())
        }
        "ValidationException" => GatewayError::BadRequest(message.to_string()),
        "AccessDeniedException" | "UnrecognizedClientException" => GatewayError::InvalidProviderConfig(message.to_string()),
        "ResourceNotFoundException" => GatewayError::MissingModel(message.to_string()),
        "ModelTimeoutException" => GatewayError::ReadTimeout(message.to_string()),
        "ModelNotReadyException" | "ServiceUnavailableException" | "InternalServerException" => {
            GatewayError::ProviderUnavailable(message.to_string())
        }
        _ => GatewayError::ProviderInternalError(format!("{code}: {message}")),
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Bedrock
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "anthropic.claude-3-5-sonnet-20241022-v2:0"
    }

    fn can_reference_files_by_url(&self) -> bool {
        false
    }

    fn is_streamable(&self, _model: &str, _tools: &[Tool]) -> bool {
        true
    }

    fn sanitize_model_data(&self, _model_data: &mut ModelData) {}

    async fn complete(&self, messages: &[Message], options: &CallOptions) -> Result<ParsedResponse> {
        let system: Vec<SystemContentBlock> = messages
            .iter()
            .filter(|m| matches!(m.role, Role::System | Role::Developer))
            .map(|m| SystemContentBlock::Text(m.text_content()))
            .collect();

        let bedrock_messages: Vec<BedrockMessage> = messages.iter().filter_map(to_bedrock_message).collect();

        let mut request = self.client.converse().model_id(&options.model).set_system(Some(system)).set_messages(Some(bedrock_messages));

        let mut inference = InferenceConfiguration::builder();
        if let Some(t) = options.temperature {
            inference = inference.temperature(t);
        }
        if let Some(p) = options.top_p {
            inference = inference.top_p(p);
        }
        if let Some(m) = options.max_output_tokens {
            inference = inference.max_tokens(m as i32);
        }
        request = request.inference_config(inference.build());

        if !options.tools.is_empty() {
            let tool_config = ToolConfiguration::builder()
                .set_tools(Some(options.tools.iter().map(to_bedrock_tool).collect()))
                .build()
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            request = request.tool_config(tool_config);
        }

        let output = request.send().await.map_err(|e| handle_bedrock_error(e.into_service_error()))?;

        let finish_reason = Some(output.stop_reason().as_str().to_string());

        let mut content = Vec::new();
        let mut tool_call_index = 0;

        if let Some(aws_sdk_bedrockruntime::types::ConverseOutput::Message(message)) = output.output {
            for block in message.content {
                match block {
                    ContentBlock::Text(text) => content.push(ContentPart::Text { text }),
                    ContentBlock::ToolUse(tool_use) => {
                        content.push(ContentPart::ToolCallRequest {
                            id: tool_use.tool_use_id,
                            tool_name: tool_use.name,
                            input: document_to_json(&tool_use.input),
                            index: Some(tool_call_index),
                        });
                        tool_call_index += 1;
                    }
                    _ => {}
                }
            }
        }

        let usage = output.usage.map(|u| LlmUsage {
            prompt_tokens_total: u.input_tokens as u32,
            prompt_tokens_text: u.input_tokens as u32,
            prompt_tokens_audio: 0,
            prompt_tokens_cached: u.cache_read_input_tokens.unwrap_or(0) as u32,
            completion_tokens_total: u.output_tokens as u32,
            completion_tokens_reasoning: 0,
            prompt_image_count: 0,
            completion_image_count: 0,
            prompt_audio_duration_seconds: None,
            cost_usd: None,
        });

        Ok(ParsedResponse { messages: vec![Message { role: Role::Assistant, content }], usage, finish_reason })
    }

    async fn stream(&self, messages: &[Message], options: &CallOptions) -> Result<ChatCompletionStream> {
        let system: Vec<SystemContentBlock> = messages
            .iter()
            .filter(|m| matches!(m.role, Role::System | Role::Developer))
            .map(|m| SystemContentBlock::Text(m.text_content()))
            .collect();

        let bedrock_messages: Vec<BedrockMessage> = messages.iter().filter_map(to_bedrock_message).collect();

        let mut request = self
            .client
            .converse_stream()
            .model_id(&options.model)
            .set_system(Some(system))
            .set_messages(Some(bedrock_messages));

        let mut inference = InferenceConfiguration::builder();
        if let Some(t) = options.temperature {
            inference = inference.temperature(t);
        }
        if let Some(m) = options.max_output_tokens {
            inference = inference.max_tokens(m as i32);
        }
        request = request.inference_config(inference.build());

        let output = request.send().await.map_err(|e| handle_bedrock_error(e.into_service_error()))?;

        let chunk_stream = stream::unfold(output.stream, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(Some(event)) => {
                        if let Some(chunk) = bedrock_event_to_chunk(event) {
                            return Some((Ok(chunk), receiver));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(handle_bedrock_error(e.into_service_error())), receiver)),
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn check_valid(&self) -> bool {
        true
    }
}

fn bedrock_event_to_chunk(event: aws_sdk_bedrockruntime::types::ConverseStreamOutput) -> Option<ParsedChunk> {
    use aws_sdk_bedrockruntime::types::{ContentBlockDelta, ConverseStreamOutput};

    match event {
        ConverseStreamOutput::ContentBlockDelta(event) => {
            let delta = event.delta?;
            match delta {
                ContentBlockDelta::Text(text) => Some(ParsedChunk { delta_text: Some(text), ..Default::default() }),
                ContentBlockDelta::ToolUse(tool_use) => Some(ParsedChunk {
                    tool_call_deltas: vec![super::ToolCallDelta {
                        id: None,
                        index: Some(event.content_block_index as u32),
                        tool_name: None,
                        arguments_fragment: Some(tool_use.input),
                    }],
                    ..Default::default()
                }),
                _ => None,
            }
        }
        ConverseStreamOutput::MessageStop(event) => {
            Some(ParsedChunk { finish_reason: Some(event.stop_reason.as_str().to_string()), ..Default::default() })
        }
        ConverseStreamOutput::Metadata(event) => event.usage.map(|u| ParsedChunk {
            usage: Some(LlmUsage {
                prompt_tokens_total: u.input_tokens as u32,
                prompt_tokens_text: u.input_tokens as u32,
                prompt_tokens_audio: 0,
                prompt_tokens_cached: u.cache_read_input_tokens.unwrap_or(0) as u32,
                completion_tokens_total: u.output_tokens as u32,
                completion_tokens_reasoning: 0,
                prompt_image_count: 0,
                completion_image_count: 0,
                prompt_audio_duration_seconds: None,
                cost_usd: None,
            }),
            ..Default::default()
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_classified_as_rate_limit() {
        let error = classify_bedrock_code("ThrottlingException", "too many requests");
        assert!(error.policy().retry);
    }

    #[test]
    fn validation_error_mentioning_length_is_context_exceeded() {
        let error = classify_bedrock_code("ValidationException", "input is too long for this model");
        assert!(matches!(error, GatewayError::MaxTokensExceeded(_)));
    }

    #[test]
    fn validation_error_mentioning_tool_config_is_structured_generation_error() {
        let error = classify_bedrock_code("ValidationException", "toolConfig.tools.0.toolSpec.inputSchema is invalid");
        assert!(matches!(error, GatewayError::StructuredGenerationError(_)));
    }

    #[test]
    fn validation_error_mentioning_guardrail_is_content_moderation() {
        let error = classify_bedrock_code("ValidationException", "blocked by guardrail policy");
        assert!(matches!(error, GatewayError::ContentModeration(_)));
    }

    #[test]
    fn json_document_round_trips_through_documents() {
        let value = serde_json::json!({"a": 1, "b": [true, "x"]});
        let doc = json_to_document(&value);
        let back = document_to_json(&doc);

        assert_eq!(back["a"], 1);
        assert_eq!(back["b"][0], true);
    }
}
