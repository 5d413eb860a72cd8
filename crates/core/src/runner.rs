//! Runner (spec §4.3): turns one `(Version, AgentInput)` pair into an
//! `AgentCompletion`. Four phases per attempt: render the prompt into
//! messages, drive the retry/fallback pipeline until a provider call
//! succeeds or the pipeline is exhausted, run the hosted-tool-call loop,
//! then validate and price the result.
//!
//! The runner never constructs a [`crate::provider::Provider`] directly —
//! that's [`ProviderFactory`]'s job — so it stays testable against a fake
//! factory without any network.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use base64::Engine as _;
use fastrace::future::FutureExt as _;
use gateway_config::{GatewayConfig, ProviderId};
use secrecy::SecretString;
use serde_json::Value;

use crate::{
    cost,
    domain::{
        AgentCompletion, AgentInput, CompletionOutput, ContentPart, FileFormat, LlmCompletionTrace, Message, Role,
        Version,
    },
    error::{GatewayError, Result},
    pipeline::{ExhaustionReason, ModelCatalog, Pipeline, PipelineStep, PlannedAttempt},
    provider::{CallOptions, Provider},
    repository::ToolCatalog,
    request::RequestContext,
    schema, template,
};

/// Builds a live adapter for one planned attempt. Kept separate from
/// [`crate::provider::Provider`] construction inside the pipeline so the
/// pipeline's ordering logic stays unit-testable without touching HTTP or
/// AWS SDK clients.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, provider_id: ProviderId, api_key: &SecretString, base_url: Option<&str>) -> Result<Arc<dyn Provider>>;
}

/// Executes a hosted (`@`-prefixed) tool locally. Tools without the `@`
/// prefix are external: the runner surfaces their call request to the
/// caller instead of invoking this trait (spec glossary "Hosted tool").
#[async_trait]
pub trait HostedToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, input: &Value) -> Result<Value>;
}

/// Per-model pricing, looked up as traces accumulate so the runner never
/// needs the whole catalog loaded up front.
pub struct Runner<'a> {
    pub config: &'a GatewayConfig,
    pub catalog: &'a dyn ModelCatalog,
    pub tools: &'a dyn ToolCatalog,
    pub factory: &'a dyn ProviderFactory,
    pub tool_executor: &'a dyn HostedToolExecutor,
    /// Hosted tool-call round trips permitted before the run gives up (spec
    /// §4.3 step 3, default 10).
    pub max_tool_call_iterations: u32,
}

impl<'a> Runner<'a> {
    /// Run one completion to its terminal state. Never panics or returns an
    /// `Err`: every failure mode is recorded as `CompletionOutput::Error` on
    /// the returned completion (spec §3 "emitted exactly once whether it
    /// succeeds or fails").
    pub async fn run(&self, agent_id: &str, version: &Version, input: &AgentInput, context: &RequestContext) -> AgentCompletion {
        let start = Instant::now();
        let span = context.new_span("runner.run");

        let mut completion = AgentCompletion {
            id: AgentCompletion::new_id(),
            agent_id: agent_id.to_string(),
            version: version.clone(),
            input_id: input.id.clone(),
            output: CompletionOutput::Error { error: GatewayError::InternalError("run did not complete".into()) },
            duration_ms: 0,
            cost_usd: None,
            traces: vec![],
            conversation_id: context.conversation_id.clone(),
            metadata: Value::Null,
        };

        completion.output = match self.run_inner(version, input, context, &mut completion.traces).in_span(span).await {
            Ok(messages) => CompletionOutput::Success { messages },
            Err(error) => CompletionOutput::Error { error },
        };

        completion.duration_ms = start.elapsed().as_millis() as u64;

        let pricing_by_model = self.pricing_for_traces(&completion.traces);
        cost::finalize_completion(&mut completion, &pricing_by_model);

        completion
    }

    /// Stream one completion (spec §4.1 "Streaming", §8 properties 6 and S4,
    /// S6). Unlike [`Self::run`], fallback is only applied to pick the
    /// *first* attempt — once a chunk has reached the caller there is no
    /// way to retry on a different provider without the caller seeing a
    /// partial response twice (spec §5 "Streaming cancellation ... no
    /// further chunks are emitted"), so a mid-stream error simply ends the
    /// stream with that error. A non-streamable model (or one whose tools
    /// disable streaming, spec `Provider::is_streamable`) is served by a
    /// single `complete()` call adapted into a one-chunk stream.
    ///
    /// Trace/cost bookkeeping for a streamed call is the caller's
    /// responsibility once the stream is drained (this method has no
    /// terminal point at which to append an `AgentCompletion`), mirroring
    /// how the teacher's own streaming path hands raw chunks upward rather
    /// than aggregating them itself.
    pub async fn run_streaming(
        &self,
        version: &Version,
        input: &AgentInput,
        context: &RequestContext,
    ) -> Result<crate::provider::ChatCompletionStream> {
        use futures::stream::{self, StreamExt};

        let mut conversation = prepare_messages(version, input)?;

        let model_data = self
            .catalog
            .get(&version.model)
            .ok_or_else(|| GatewayError::MissingModel(version.model.clone()))?;

        let required_modality = required_modality(&conversation);
        let base_options = build_call_options(version, &model_data, self.tools);
        let mut pipeline = Pipeline::new(version, model_data, base_options, self.config, self.catalog, required_modality);

        let attempt = match pipeline.next() {
            PipelineStep::Attempt(attempt) => attempt,
            PipelineStep::Exhausted(ExhaustionReason::NoProvider(error)) => return Err(error),
            PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts) => {
                return Err(GatewayError::InternalError("pipeline produced no attempt for a fresh request".into()));
            }
        };

        let provider = self.resolve_provider(&attempt, context).await?;

        let mut model_data = attempt.model_data.clone();
        provider.sanitize_model_data(&mut model_data);
        let mut options = attempt.options.clone();
        options.structured_generation = options.structured_generation && model_data.supports.structured_output;

        download_files_for_provider(provider.as_ref(), &attempt.model_name, &mut conversation).await?;

        if !provider.is_streamable(&attempt.model_name, &options.tools) {
            let response = provider.complete(&conversation, &options).await?;
            let chunk = crate::provider::ParsedChunk {
                delta_text: Some(response.messages.iter().map(Message::text_content).collect::<Vec<_>>().join("")),
                usage: response.usage,
                finish_reason: response.finish_reason,
                ..Default::default()
            };
            let chunk: Result<crate::provider::ParsedChunk> = Ok(chunk);
            return Ok(Box::pin(stream::iter(vec![chunk])));
        }

        let inner = provider.stream(&conversation, &options).await?;

        enum StreamState {
            Running(crate::provider::ChatCompletionStream),
            PendingError(GatewayError),
        }

        // Spec §8 S6: a `finish_reason == "length"` delta still delivers
        // its chunk (it carries the final usage frame) and only then raises
        // `MaxTokensExceeded`, closing the stream on the following poll.
        let wrapped = stream::unfold(Some(StreamState::Running(inner)), |state| async move {
            match state? {
                StreamState::Running(mut inner) => match inner.next().await {
                    None => None,
                    Some(Ok(chunk)) if chunk.finish_reason.as_deref() == Some("length") => {
                        let error = GatewayError::MaxTokensExceeded("completion truncated by max_output_tokens".into());
                        Some((Ok(chunk), Some(StreamState::PendingError(error))))
                    }
                    Some(other) => Some((other, Some(StreamState::Running(inner)))),
                },
                StreamState::PendingError(error) => Some((Err(error), None)),
            }
        });

        Ok(Box::pin(wrapped))
    }

    fn pricing_for_traces(&self, traces: &[LlmCompletionTrace]) -> BTreeMap<String, crate::domain::Pricing> {
        let mut table = BTreeMap::new();
        for trace in traces {
            if table.contains_key(&trace.model) {
                continue;
            }
            if let Some(model_data) = self.catalog.get(&trace.model) {
                table.insert(trace.model.clone(), model_data.pricing);
            }
        }
        table
    }

    async fn run_inner(
        &self,
        version: &Version,
        input: &AgentInput,
        context: &RequestContext,
        traces: &mut Vec<LlmCompletionTrace>,
    ) -> Result<Vec<Message>> {
        let mut conversation = prepare_messages(version, input)?;

        let model_data = self
            .catalog
            .get(&version.model)
            .ok_or_else(|| GatewayError::MissingModel(version.model.clone()))?;

        let required_modality = required_modality(&conversation);
        let base_options = build_call_options(version, &model_data, self.tools);

        let mut pipeline = Pipeline::new(version, model_data, base_options, self.config, self.catalog, required_modality);

        let mut step = pipeline.next();
        loop {
            let attempt = match step {
                PipelineStep::Attempt(attempt) => attempt,
                PipelineStep::Exhausted(ExhaustionReason::NoProvider(error)) => return Err(error),
                PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts) => {
                    return Err(pipeline.first_error().cloned().unwrap_or(GatewayError::InternalError("pipeline exhausted without a recorded error".into())));
                }
            };

            match self.run_attempt(&attempt, &mut conversation, context, traces).await {
                Ok(messages) => return Ok(messages),
                Err(error) => {
                    step = pipeline.retry_after_error(error);
                }
            }
        }
    }

    /// Build a provider for `attempt` and drive it, including the
    /// hosted-tool-call loop, until a final answer or an error that should
    /// go back to the pipeline.
    async fn run_attempt(
        &self,
        attempt: &PlannedAttempt,
        conversation: &mut Vec<Message>,
        context: &RequestContext,
        traces: &mut Vec<LlmCompletionTrace>,
    ) -> Result<Vec<Message>> {
        let provider = self.resolve_provider(attempt, context).await?;

        // Spec §4.3 step 2: let the provider correct for its own quirks
        // (e.g. a vendor that can't do structured output and tool calling
        // in the same request) before deciding whether structured
        // generation actually stays on for this attempt.
        let mut model_data = attempt.model_data.clone();
        provider.sanitize_model_data(&mut model_data);

        let mut options = attempt.options.clone();
        options.structured_generation = options.structured_generation && model_data.supports.structured_output;

        download_files_for_provider(provider.as_ref(), &attempt.model_name, conversation).await?;

        let mut tool_iterations = 0u32;

        loop {
            let call_start = Instant::now();

            let response = match provider.complete(conversation, &options).await {
                Ok(response) => response,
                Err(error) => {
                    traces.push(LlmCompletionTrace {
                        messages_sent: conversation.clone(),
                        model: attempt.model_name.clone(),
                        provider: attempt.provider_id,
                        config_reference: attempt.credential_label.clone(),
                        duration_ms: call_start.elapsed().as_millis() as u64,
                        usage: None,
                        error: Some(error.clone()),
                        provider_request_incurs_cost: error.provider_request_incurs_cost(),
                    });
                    return Err(error);
                }
            };

            traces.push(LlmCompletionTrace {
                messages_sent: conversation.clone(),
                model: attempt.model_name.clone(),
                provider: attempt.provider_id,
                config_reference: attempt.credential_label.clone(),
                duration_ms: call_start.elapsed().as_millis() as u64,
                usage: response.usage.clone(),
                error: None,
                provider_request_incurs_cost: true,
            });

            let tool_calls: Vec<(String, String, Value)> = response
                .messages
                .iter()
                .flat_map(|m| m.tool_call_requests())
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            conversation.extend(response.messages.clone());

            if tool_calls.is_empty() {
                return self.validate_output(attempt, response.messages);
            }

            if tool_calls.iter().any(|(_, name, _)| !name.starts_with('@')) {
                // An external tool was requested: the caller, not this
                // runner, resolves it. Surface the conversation as-is.
                return Ok(conversation.clone());
            }

            tool_iterations += 1;
            if tool_iterations > self.max_tool_call_iterations {
                return Err(GatewayError::MaxToolCallIteration);
            }

            for (id, name, input) in &tool_calls {
                let result = self.tool_executor.execute(name, input).await;
                let part = match result {
                    Ok(value) => ContentPart::ToolCallResult { id: id.clone(), result: Some(value), error: None },
                    Err(error) => ContentPart::ToolCallResult { id: id.clone(), result: None, error: Some(error.to_string()) },
                };
                conversation.push(Message { role: Role::Tool, content: vec![part] });
            }
        }
    }

    async fn resolve_provider(&self, attempt: &PlannedAttempt, context: &RequestContext) -> Result<Arc<dyn Provider>> {
        let provider_config = self
            .config
            .provider(attempt.provider_id)
            .ok_or_else(|| GatewayError::InvalidProviderConfig(format!("no configuration for provider '{}'", attempt.provider_id)))?;

        let api_key = match &context.api_key_override {
            Some(key) => key.clone(),
            None => provider_config
                .credentials
                .iter()
                .find(|credential| credential.label == attempt.credential_label)
                .map(|credential| credential.api_key.clone())
                .ok_or_else(|| {
                    GatewayError::InvalidProviderConfig(format!(
                        "credential '{}' not found for provider '{}'",
                        attempt.credential_label, attempt.provider_id
                    ))
                })?,
        };

        self.factory.build(attempt.provider_id, &api_key, provider_config.base_url.as_deref()).await
    }

    /// Spec §4.3 step 4: tolerant-parse, sanitise, then validate the raw
    /// output against `output_schema` when one was requested.
    fn validate_output(&self, attempt: &PlannedAttempt, messages: Vec<Message>) -> Result<Vec<Message>> {
        let Some(output_schema) = &attempt.options.output_schema else {
            return Ok(messages);
        };

        let raw_text = messages.iter().map(Message::text_content).collect::<Vec<_>>().join("");
        let mut parsed = schema::parse_tolerant(&raw_text)?;
        schema::sanitize_nulls(&mut parsed, output_schema);
        schema::validate(&parsed, output_schema).map_err(GatewayError::InvalidGeneration)?;

        let mut out = messages;
        out.push(Message { role: Role::Assistant, content: vec![ContentPart::Object { value: parsed }] });
        Ok(out)
    }
}

/// Render the prompt template against `input.variables`, prepend it to any
/// caller-supplied messages, then append a plain-text instruction to answer
/// with a JSON object when an `output_schema` was requested but structured
/// generation is off — the model has no other way to learn the expected
/// shape in that case (spec §4.3 step 1).
fn prepare_messages(version: &Version, input: &AgentInput) -> Result<Vec<Message>> {
    let mut messages = Vec::new();

    for template_message in &version.prompt {
        let rendered = render_message(template_message, input)?;
        messages.push(rendered);
    }

    if let Some(caller_messages) = &input.messages {
        messages.extend(caller_messages.clone());
    }

    if version.output_schema.is_some() && !version.structured_generation {
        let already_mentioned = messages.iter().any(|m| m.text_content().contains("JSON schema"));
        if !already_mentioned {
            messages.push(Message::text(Role::System, "Respond with a JSON object that matches the requested JSON schema."));
        }
    }

    Ok(messages)
}

fn render_message(message: &Message, input: &AgentInput) -> Result<Message> {
    let variables = input.variables.clone().unwrap_or(Value::Null);
    let content = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } if template::is_template(text) => {
                Ok(ContentPart::Text { text: template::render(text, &variables)? })
            }
            other => Ok(other.clone()),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Message { role: message.role, content })
}

/// Fetch and inline every attached file `provider` can't consume by
/// reference for `model_name` (spec §4.3 step 1 file handling; see
/// [`crate::domain::File::requires_downloading`]). Mutates in place so a
/// file downloaded for one attempt stays inline for any subsequent
/// fallback attempt too.
async fn download_files_for_provider(provider: &dyn Provider, model_name: &str, conversation: &mut [Message]) -> Result<()> {
    let client = crate::provider::http_client::http_client();

    for message in conversation.iter_mut() {
        for part in &mut message.content {
            let ContentPart::File { file } = part else { continue };

            if !provider.requires_downloading_file(file, model_name) {
                continue;
            }

            let url = file.url.clone().ok_or_else(|| GatewayError::InvalidFile("file requires downloading but has no url".into()))?;

            let response = client
                .get(&url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|error| GatewayError::InvalidFile(format!("failed to download file '{url}': {error}")))?;

            let content_type = file
                .content_type
                .clone()
                .or_else(|| response.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string));

            let bytes = response
                .bytes()
                .await
                .map_err(|error| GatewayError::InvalidFile(format!("failed to read file body '{url}': {error}")))?;

            file.data = Some(base64::engine::general_purpose::STANDARD.encode(&bytes));
            file.url = None;
            file.content_type = content_type;
        }
    }

    Ok(())
}

/// The one file modality, if any, the conversation requires a fallback
/// model to support too (spec §4.2 step 4 "modality typology").
fn required_modality(messages: &[Message]) -> Option<FileFormat> {
    messages.iter().flat_map(|m| &m.content).find_map(|part| match part {
        ContentPart::File { file } => file.format,
        _ => None,
    })
}

fn build_call_options(version: &Version, model_data: &crate::domain::ModelData, tool_catalog: &dyn ToolCatalog) -> CallOptions {
    let tools: Vec<crate::domain::Tool> = version.enabled_tools.iter().filter_map(|name| tool_catalog.get(name)).collect();

    CallOptions {
        model: version.model.clone(),
        temperature: version.temperature,
        top_p: version.top_p,
        max_output_tokens: version.max_output_tokens.or(Some(model_data.max_tokens.max_output_tokens)),
        presence_penalty: version.presence_penalty,
        frequency_penalty: version.frequency_penalty,
        parallel_tool_calls: version.parallel_tool_calls,
        tools,
        tool_choice: version.tool_choice.clone(),
        output_schema: version.output_schema.clone(),
        structured_generation: version.structured_generation && model_data.supports.structured_output,
        reasoning_effort: version.reasoning_effort,
        reasoning_budget: version.reasoning_budget,
        stream: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FallbackMap, MaxTokensData, ModelData, ModelProviderEntry, Pricing, SupportFlags, TieredRate};
    use serde_json::json;

    struct NoTools;
    impl ToolCatalog for NoTools {
        fn get(&self, _name: &str) -> Option<crate::domain::Tool> {
            None
        }
    }

    struct OneModelCatalog(ModelData);
    impl ModelCatalog for OneModelCatalog {
        fn get(&self, model_id: &str) -> Option<ModelData> {
            (model_id == self.0.id).then(|| self.0.clone())
        }
    }

    /// Streams back a single chunk whose `finish_reason` the test controls,
    /// so `run_streaming`'s max-tokens wrapping can be exercised without a
    /// network.
    struct TruncatingProvider;

    #[async_trait]
    impl Provider for TruncatingProvider {
        fn id(&self) -> ProviderId {
            ProviderId::OpenAi
        }
        fn supports_model(&self, _model: &str) -> bool {
            true
        }
        fn default_model(&self) -> &str {
            "m"
        }
        fn is_streamable(&self, _model: &str, _tools: &[crate::domain::Tool]) -> bool {
            true
        }
        fn sanitize_model_data(&self, _model_data: &mut ModelData) {}
        async fn complete(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ParsedResponse> {
            unreachable!("test only exercises the streaming path")
        }
        async fn stream(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ChatCompletionStream> {
            let chunk = crate::provider::ParsedChunk {
                delta_text: Some("partial".into()),
                finish_reason: Some("length".into()),
                ..Default::default()
            };
            Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
        }
        async fn check_valid(&self) -> bool {
            true
        }
    }

    struct SingleFactory;
    #[async_trait]
    impl ProviderFactory for SingleFactory {
        async fn build(&self, _provider_id: ProviderId, _api_key: &SecretString, _base_url: Option<&str>) -> Result<Arc<dyn Provider>> {
            Ok(Arc::new(TruncatingProvider))
        }
    }

    struct NoopTools;
    #[async_trait]
    impl HostedToolExecutor for NoopTools {
        async fn execute(&self, _tool_name: &str, _input: &Value) -> Result<Value> {
            unreachable!("test has no hosted tool calls")
        }
    }

    /// Always asks to call `@loop` again, so the runner's tool-call loop
    /// never terminates on its own and `max_tool_call_iterations` is what
    /// finally ends the run.
    struct LoopingToolCaller;

    #[async_trait]
    impl Provider for LoopingToolCaller {
        fn id(&self) -> ProviderId {
            ProviderId::OpenAi
        }
        fn supports_model(&self, _model: &str) -> bool {
            true
        }
        fn default_model(&self) -> &str {
            "m"
        }
        fn is_streamable(&self, _model: &str, _tools: &[crate::domain::Tool]) -> bool {
            false
        }
        fn sanitize_model_data(&self, _model_data: &mut ModelData) {}
        async fn complete(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ParsedResponse> {
            Ok(crate::provider::ParsedResponse {
                messages: vec![Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolCallRequest {
                        id: "call_1".into(),
                        tool_name: "@loop".into(),
                        input: Value::Null,
                        index: None,
                    }],
                }],
                usage: None,
                finish_reason: None,
            })
        }
        async fn stream(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ChatCompletionStream> {
            unreachable!("test only exercises the non-streaming tool-call loop")
        }
        async fn check_valid(&self) -> bool {
            true
        }
    }

    struct LoopingFactory;
    #[async_trait]
    impl ProviderFactory for LoopingFactory {
        async fn build(&self, _provider_id: ProviderId, _api_key: &SecretString, _base_url: Option<&str>) -> Result<Arc<dyn Provider>> {
            Ok(Arc::new(LoopingToolCaller))
        }
    }

    struct EchoTool;
    #[async_trait]
    impl HostedToolExecutor for EchoTool {
        async fn execute(&self, _tool_name: &str, _input: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn config_with_openai_credential() -> GatewayConfig {
        use gateway_config::{ProviderConfig, ProviderCredential};
        let mut config = GatewayConfig::default();
        config.providers.insert(
            ProviderId::OpenAi,
            ProviderConfig {
                credentials: vec![ProviderCredential { label: "default".into(), api_key: SecretString::from("sk-test") }],
                ..Default::default()
            },
        );
        config
    }

    fn pricing() -> Pricing {
        Pricing {
            prompt_text_per_token: TieredRate::flat(0.0),
            completion_text_per_token: TieredRate::flat(0.0),
            cached_token_discount: 0.0,
            per_image: None,
            completion_per_image: None,
            prompt_audio_per_token: None,
            prompt_audio_per_second: None,
        }
    }

    fn model_data() -> ModelData {
        ModelData {
            id: "m".into(),
            max_tokens: MaxTokensData::default(),
            supports: SupportFlags::default(),
            reasoning_budget: None,
            pricing: pricing(),
            providers: vec![ModelProviderEntry { provider: ProviderId::OpenAi, model_name_override: None }],
            fallback: FallbackMap::default(),
            modalities: vec![],
        }
    }

    fn base_version() -> Version {
        Version {
            id: String::new(),
            model: "m".into(),
            provider: None,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            parallel_tool_calls: None,
            enabled_tools: vec![],
            tool_choice: None,
            prompt: vec![Message::text(Role::System, "hello {{ name }}")],
            input_variables_schema: None,
            output_schema: None,
            structured_generation: true,
            use_structured_generation: false,
            reasoning_effort: None,
            reasoning_budget: None,
            use_fallback: Default::default(),
        }
    }

    #[test]
    fn prepare_messages_renders_the_prompt_template() {
        let version = base_version();
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };

        let messages = prepare_messages(&version, &input).unwrap();
        assert_eq!(messages[0].text_content(), "hello Ada");
    }

    #[test]
    fn prepare_messages_appends_caller_messages_after_the_prompt() {
        let version = base_version();
        let input = AgentInput {
            id: "i".into(),
            messages: Some(vec![Message::text(Role::User, "what's the weather?")]),
            variables: Some(json!({"name": "Ada"})),
        };

        let messages = prepare_messages(&version, &input).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text_content(), "what's the weather?");
    }

    #[test]
    fn prepare_messages_appends_json_instruction_when_structured_generation_is_off() {
        let mut version = base_version();
        version.output_schema = Some(json!({"type": "object"}));
        version.structured_generation = false;
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };

        let messages = prepare_messages(&version, &input).unwrap();
        assert!(messages.last().unwrap().text_content().contains("JSON"));
    }

    #[test]
    fn prepare_messages_skips_json_instruction_when_structured_generation_is_on() {
        let mut version = base_version();
        version.output_schema = Some(json!({"type": "object"}));
        version.structured_generation = true;
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };

        let messages = prepare_messages(&version, &input).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn prepare_messages_skips_json_instruction_when_prompt_already_mentions_schema() {
        let mut version = base_version();
        version.output_schema = Some(json!({"type": "object"}));
        version.structured_generation = false;
        version.prompt = vec![Message::text(Role::System, "Always answer using the JSON schema provided.")];
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };

        let messages = prepare_messages(&version, &input).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn download_files_for_provider_leaves_files_the_provider_can_use_by_url_untouched() {
        struct UrlFriendlyProvider;
        #[async_trait]
        impl Provider for UrlFriendlyProvider {
            fn id(&self) -> ProviderId {
                ProviderId::OpenAi
            }
            fn supports_model(&self, _model: &str) -> bool {
                true
            }
            fn default_model(&self) -> &str {
                "m"
            }
            fn is_streamable(&self, _model: &str, _tools: &[crate::domain::Tool]) -> bool {
                false
            }
            fn sanitize_model_data(&self, _model_data: &mut ModelData) {}
            fn can_reference_files_by_url(&self) -> bool {
                true
            }
            async fn complete(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ParsedResponse> {
                unreachable!("test only exercises file sanitization")
            }
            async fn stream(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ChatCompletionStream> {
                unreachable!("test only exercises file sanitization")
            }
            async fn check_valid(&self) -> bool {
                true
            }
        }

        let file = crate::domain::File { data: None, url: Some("https://example.com/a.png".into()), content_type: Some("image/png".into()), format: Some(FileFormat::Image) };
        let mut conversation = vec![Message { role: Role::User, content: vec![ContentPart::File { file }] }];

        download_files_for_provider(&UrlFriendlyProvider, "m", &mut conversation).await.unwrap();

        let ContentPart::File { file } = &conversation[0].content[0] else { panic!("expected a file part") };
        assert_eq!(file.url.as_deref(), Some("https://example.com/a.png"));
        assert!(file.data.is_none());
    }

    #[test]
    fn build_call_options_disables_structured_generation_when_unsupported() {
        let mut version = base_version();
        version.structured_generation = true;
        let mut data = model_data();
        data.supports.structured_output = false;

        let options = build_call_options(&version, &data, &NoTools);
        assert!(!options.structured_generation);
    }

    #[test]
    fn required_modality_finds_the_first_attached_file_format() {
        let messages = vec![Message {
            role: Role::User,
            content: vec![ContentPart::File { file: crate::domain::File { data: None, url: Some("https://x/a.png".into()), content_type: None, format: Some(FileFormat::Image) } }],
        }];
        assert_eq!(required_modality(&messages), Some(FileFormat::Image));
    }

    #[tokio::test]
    async fn run_streaming_delivers_the_truncated_chunk_then_raises_max_tokens() {
        use futures::StreamExt;

        let config = config_with_openai_credential();
        let catalog = OneModelCatalog(model_data());
        let factory = SingleFactory;
        let tool_executor = NoopTools;
        let runner = Runner { config: &config, catalog: &catalog, tools: &NoTools, factory: &factory, tool_executor: &tool_executor, max_tool_call_iterations: 10 };

        let version = base_version();
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };
        let context = RequestContext::default();

        let mut stream = runner.run_streaming(&version, &input, &context).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.finish_reason.as_deref(), Some("length"));

        let second = stream.next().await.unwrap();
        assert!(matches!(second, Err(GatewayError::MaxTokensExceeded(_))));

        assert!(stream.next().await.is_none());
    }

    /// A provider whose `sanitize_model_data` always turns off structured
    /// output (mirroring Google's "can't have structured output and tool
    /// calling together" quirk), recording the `CallOptions` it actually
    /// received so the test can check the runner applied the sanitized
    /// flag rather than the raw one the pipeline planned.
    struct QuirkyProvider(std::sync::Mutex<Option<CallOptions>>);

    #[async_trait]
    impl Provider for QuirkyProvider {
        fn id(&self) -> ProviderId {
            ProviderId::OpenAi
        }
        fn supports_model(&self, _model: &str) -> bool {
            true
        }
        fn default_model(&self) -> &str {
            "m"
        }
        fn is_streamable(&self, _model: &str, _tools: &[crate::domain::Tool]) -> bool {
            false
        }
        fn sanitize_model_data(&self, model_data: &mut ModelData) {
            model_data.supports.structured_output = false;
        }
        async fn complete(&self, _messages: &[Message], options: &CallOptions) -> Result<crate::provider::ParsedResponse> {
            *self.0.lock().unwrap() = Some(options.clone());
            Ok(crate::provider::ParsedResponse {
                messages: vec![Message::text(Role::Assistant, "done")],
                usage: None,
                finish_reason: None,
            })
        }
        async fn stream(&self, _messages: &[Message], _options: &CallOptions) -> Result<crate::provider::ChatCompletionStream> {
            unreachable!("test only exercises the non-streaming path")
        }
        async fn check_valid(&self) -> bool {
            true
        }
    }

    struct QuirkyFactory(Arc<QuirkyProvider>);
    #[async_trait]
    impl ProviderFactory for QuirkyFactory {
        async fn build(&self, _provider_id: ProviderId, _api_key: &SecretString, _base_url: Option<&str>) -> Result<Arc<dyn Provider>> {
            Ok(self.0.clone())
        }
    }

    /// Spec §4.3 step 2: a provider's own quirk sanitization runs before
    /// each attempt, so structured generation it can't actually satisfy
    /// never reaches the wire even though the pipeline planned it on.
    #[tokio::test]
    async fn run_attempt_applies_provider_sanitize_model_data_before_calling() {
        let config = config_with_openai_credential();
        let mut data = model_data();
        data.supports.structured_output = true;
        let catalog = OneModelCatalog(data);
        let provider = Arc::new(QuirkyProvider(std::sync::Mutex::new(None)));
        let factory = QuirkyFactory(provider.clone());
        let tool_executor = NoopTools;
        let runner = Runner { config: &config, catalog: &catalog, tools: &NoTools, factory: &factory, tool_executor: &tool_executor, max_tool_call_iterations: 10 };

        let mut version = base_version();
        version.structured_generation = true;
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };
        let context = RequestContext::default();

        let completion = runner.run("agent", &version, &input, &context).await;
        assert!(matches!(completion.output, CompletionOutput::Success { .. }));

        let received = provider.0.lock().unwrap().clone().expect("complete() was called");
        assert!(!received.structured_generation);
    }

    /// Spec §8 property 5: a hosted tool that keeps asking to be called
    /// again terminates in exactly `max_tool_call_iterations + 1` LLM calls
    /// and raises `MaxToolCallIteration`, not an infinite loop.
    #[tokio::test]
    async fn looping_hosted_tool_call_raises_max_tool_call_iteration() {
        let config = config_with_openai_credential();
        let catalog = OneModelCatalog(model_data());
        let factory = LoopingFactory;
        let tool_executor = EchoTool;
        let max_tool_call_iterations = 3;
        let runner =
            Runner { config: &config, catalog: &catalog, tools: &NoTools, factory: &factory, tool_executor: &tool_executor, max_tool_call_iterations };

        let mut version = base_version();
        version.enabled_tools = vec!["loop".into()];
        let input = AgentInput { id: "i".into(), messages: None, variables: Some(json!({"name": "Ada"})) };
        let context = RequestContext::default();

        let completion = runner.run("agent", &version, &input, &context).await;

        match completion.output {
            CompletionOutput::Error { error: GatewayError::MaxToolCallIteration } => {}
            other => panic!("expected MaxToolCallIteration, got {other:?}"),
        }
    }
}
