//! Shared adapter for vendors that speak the OpenAI chat-completions wire
//! format with small deviations: Mistral, Fireworks, Groq and Azure OpenAI
//! (spec §4.1: "Internally, adapters share a base with a fixed pipeline").
//!
//! Rather than four near-identical structs this is one adapter
//! parameterised by [`Quirks`], matching the degree of code sharing the
//! source vendors themselves allow.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use gateway_config::ProviderId;
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde_json::Value;

use super::openai::{OpenAiResponse, OpenAiStreamChunk, classify_http_error, openai_message, openai_tool, parse_response};
use super::{CallOptions, ChatCompletionStream, ParsedResponse, Provider, http_client::http_client};
use crate::{
    domain::{Message, ModelData, Tool},
    error::{GatewayError, Result},
};

/// Per-vendor deviations from the OpenAI baseline (spec §4.1: "Fireworks
/// must set `context_length_exceeded_behavior=truncate`; Mistral cannot
/// combine tools with JSON response format").
#[derive(Debug, Clone, Copy)]
pub struct Quirks {
    pub id: ProviderId,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
    pub auth_header: AuthStyle,
    /// Mistral rejects a request carrying both `tools` and a JSON
    /// `response_format`; when true, structured output is dropped whenever
    /// tools are present rather than sent and rejected by the vendor.
    pub forbids_structured_output_with_tools: bool,
    /// Fireworks truncates overflowing prompts instead of erroring unless
    /// told otherwise; we always ask for the error so the pipeline's normal
    /// `MaxTokensExceeded` handling applies.
    pub sets_context_length_exceeded_behavior: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader(&'static str),
}

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: secrecy::SecretString,
    quirks: Quirks,
}

impl OpenAiCompatibleProvider {
    pub fn new(api_key: secrecy::SecretString, base_url: Option<String>, quirks: Quirks) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| quirks.default_base_url.to_string()),
            api_key,
            quirks,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.quirks.auth_header {
            AuthStyle::Bearer => builder.bearer_auth(self.api_key.expose_secret()),
            AuthStyle::ApiKeyHeader(name) => builder.header(name, self.api_key.expose_secret()),
        }
    }

    fn build_request(&self, messages: &[Message], options: &CallOptions, stream: bool) -> Value {
        let mut body = serde_json::json!({
            "model": options.model,
            "messages": messages.iter().map(openai_message).collect::<Vec<_>>(),
            "stream": stream,
        });
        let obj = body.as_object_mut().expect("object literal");

        if let Some(t) = options.temperature {
            obj.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = options.top_p {
            obj.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(m) = options.max_output_tokens {
            obj.insert("max_tokens".into(), serde_json::json!(m));
        }

        let tools_present = !options.tools.is_empty();

        if tools_present {
            obj.insert("tools".into(), serde_json::json!(options.tools.iter().map(openai_tool).collect::<Vec<_>>()));
        }

        let wants_structured_output = options.structured_generation && options.output_schema.is_some();
        let suppress_structured_output = self.quirks.forbids_structured_output_with_tools && tools_present;

        if wants_structured_output && !suppress_structured_output {
            let schema = options.output_schema.as_ref().expect("checked above");
            obj.insert(
                "response_format".into(),
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {"name": "output", "strict": true, "schema": schema},
                }),
            );
        }

        if self.quirks.sets_context_length_exceeded_behavior {
            obj.insert("context_length_exceeded_behavior".into(), serde_json::json!("error"));
        }

        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn id(&self) -> ProviderId {
        self.quirks.id
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        self.quirks.default_model
    }

    fn can_reference_files_by_url(&self) -> bool {
        false
    }

    fn is_streamable(&self, _model: &str, _tools: &[Tool]) -> bool {
        true
    }

    fn sanitize_model_data(&self, model_data: &mut ModelData) {
        if self.quirks.forbids_structured_output_with_tools {
            model_data.supports.structured_output = model_data.supports.structured_output && !model_data.supports.tool_calling;
        }
    }

    async fn complete(&self, messages: &[Message], options: &CallOptions) -> Result<ParsedResponse> {
        let body = self.build_request(messages, options, false);

        let response = self
            .authorize(self.client.request(Method::POST, self.url()))
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
            .authorize(self.client.request(Method::POST, self.url()))
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

            if event.data == "[DONE]" {
                return None;
            }

            let chunk: OpenAiStreamChunk = serde_json::from_str(&event.data).ok()?;
            Some(Ok(chunk.into_parsed_chunk()))
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn check_valid(&self) -> bool {
        self.authorize(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

pub fn mistral_quirks() -> Quirks {
    Quirks {
        id: ProviderId::Mistral,
        default_base_url: "https://api.mistral.ai/v1",
        default_model: "mistral-large-latest",
        auth_header: AuthStyle::Bearer,
        forbids_structured_output_with_tools: true,
        sets_context_length_exceeded_behavior: false,
    }
}

pub fn fireworks_quirks() -> Quirks {
    Quirks {
        id: ProviderId::Fireworks,
        default_base_url: "https://api.fireworks.ai/inference/v1",
        default_model: "accounts/fireworks/models/llama-v3p1-70b-instruct",
        auth_header: AuthStyle::Bearer,
        forbids_structured_output_with_tools: false,
        sets_context_length_exceeded_behavior: true,
    }
}

pub fn groq_quirks() -> Quirks {
    Quirks {
        id: ProviderId::Groq,
        default_base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.3-70b-versatile",
        auth_header: AuthStyle::Bearer,
        forbids_structured_output_with_tools: false,
        sets_context_length_exceeded_behavior: false,
    }
}

pub fn azure_openai_quirks(resource: &str, deployment: &str, api_version: &str) -> Quirks {
    // Azure's URL and auth header are fixed per-resource; base_url is built
    // by the caller and passed explicitly rather than derived here since it
    // embeds the deployment name and api-version query parameter.
    let _ = (resource, deployment, api_version);
    Quirks {
        id: ProviderId::AzureOpenAi,
        default_base_url: "",
        default_model: "gpt-4.1",
        auth_header: AuthStyle::ApiKeyHeader("api-key"),
        forbids_structured_output_with_tools: false,
        sets_context_length_exceeded_behavior: false,
    }
}

pub fn azure_openai_url(resource: &str, deployment: &str, api_version: &str) -> String {
    format!("https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={api_version}")
}
