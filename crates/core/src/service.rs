//! `GatewayService` facade (spec §6): the Rust-trait equivalent of the
//! teacher's `LlmService` (an HTTP host, out of scope here, would sit on top
//! of this and translate `CompletionRequest`/`AgentCompletion` to and from
//! wire JSON). Resolves the `model`/`agent_id`/`deployment_id` routing rules
//! from spec §6.1 before handing off to the [`crate::runner::Runner`].

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    deployment_resolver::{DeploymentResolver, RuntimeOverrides},
    domain::{AgentInput, CachePolicy, ModelData, UseFallback, Version},
    error::{GatewayError, Result},
    repository::{ModelRepository, VersionRepository},
    request::RequestContext,
    runner::Runner,
};

/// Parsed form of the `model` field accepted by spec §6.1: a bare model id,
/// an `<agent_id>/<model>` pair, or a pinned deployment reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef {
    Model(String),
    AgentModel { agent_id: String, model: String },
    Deployment(String),
}

/// Spec §6.1: `anotherai/deployment/<id>`, `anotherai/deployments/<id>` and
/// `deployment/<id>` are all accepted spellings of a deployment reference.
pub fn parse_model_ref(model: &str) -> ModelRef {
    for prefix in ["anotherai/deployment/", "anotherai/deployments/", "deployment/"] {
        if let Some(id) = model.strip_prefix(prefix) {
            return ModelRef::Deployment(id.to_string());
        }
    }

    match model.split_once('/') {
        Some((agent_id, rest)) => ModelRef::AgentModel { agent_id: agent_id.to_string(), model: rest.to_string() },
        None => ModelRef::Model(model.to_string()),
    }
}

/// Everything a caller needs to supply for one completion (spec §6.1, minus
/// the HTTP-specific OpenAI body shape, which an adapter above this facade
/// would translate into this type).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub agent_id: Option<String>,
    pub input: AgentInput,
    pub runtime_overrides: RuntimeOverrides,
    pub use_cache: CachePolicy,
    pub use_fallback: Option<UseFallback>,
    pub conversation_id: Option<String>,
}

#[async_trait]
pub trait GatewayService: Send + Sync {
    async fn completions(&self, request: CompletionRequest, context: &RequestContext) -> Result<crate::domain::AgentCompletion>;
    async fn completions_stream(&self, request: CompletionRequest, context: &RequestContext) -> Result<crate::provider::ChatCompletionStream>;
    async fn models(&self) -> Result<Vec<ModelData>>;
}

pub struct Gateway<'a> {
    pub runner: Runner<'a>,
    pub deployments: DeploymentResolver<'a>,
    pub versions: &'a dyn VersionRepository,
    pub models: &'a dyn ModelRepository,
}

impl<'a> Gateway<'a> {
    pub fn new(runner: Runner<'a>, deployments: DeploymentResolver<'a>, versions: &'a dyn VersionRepository, models: &'a dyn ModelRepository) -> Self {
        Self { runner, deployments, versions, models }
    }

    async fn resolve_agent_and_version(&self, request: &CompletionRequest) -> Result<(String, Version)> {
        match parse_model_ref(&request.model) {
            ModelRef::Deployment(deployment_id) => {
                self.deployments.resolve_with_agent(&deployment_id, request.runtime_overrides.clone()).await
            }
            ModelRef::AgentModel { agent_id, model } => Ok((agent_id, ad_hoc_version(model, request))),
            ModelRef::Model(model) => {
                let agent_id = request
                    .agent_id
                    .clone()
                    .ok_or_else(|| GatewayError::BadRequest("agent_id is required when model does not embed one".into()))?;
                Ok((agent_id, ad_hoc_version(model, request)))
            }
        }
    }
}

/// Builds the throwaway `Version` for a direct `model`/`<agent_id>/<model>`
/// call: every field not implied by the request takes its default, and
/// `use_fallback` comes from the request when the caller set one.
fn ad_hoc_version(model: String, request: &CompletionRequest) -> Version {
    Version {
        id: String::new(),
        model,
        provider: None,
        temperature: None,
        top_p: None,
        max_output_tokens: None,
        presence_penalty: None,
        frequency_penalty: None,
        parallel_tool_calls: None,
        enabled_tools: vec![],
        tool_choice: None,
        prompt: vec![],
        input_variables_schema: None,
        output_schema: request.runtime_overrides.output_schema.clone(),
        structured_generation: false,
        use_structured_generation: false,
        reasoning_effort: None,
        reasoning_budget: None,
        use_fallback: request.use_fallback.clone().unwrap_or_default(),
    }
    .with_id()
}

#[async_trait]
impl<'a> GatewayService for Gateway<'a> {
    async fn completions(&self, request: CompletionRequest, context: &RequestContext) -> Result<crate::domain::AgentCompletion> {
        let (agent_id, version) = self.resolve_agent_and_version(&request).await?;

        if let Some(variables) = &request.input.variables {
            if version.input_variables_schema.is_none() && !matches!(variables, Value::Null) {
                return Err(GatewayError::BadRequest(
                    "Input variables are provided but the version does not support them".into(),
                ));
            }
        }

        self.versions.put_if_absent(version.clone()).await?;

        let mut context = context.clone();
        if context.conversation_id.is_none() {
            context.conversation_id = request.conversation_id.clone();
        }

        Ok(self.runner.run(&agent_id, &version, &request.input, &context).await)
    }

    async fn completions_stream(&self, request: CompletionRequest, context: &RequestContext) -> Result<crate::provider::ChatCompletionStream> {
        let (_agent_id, version) = self.resolve_agent_and_version(&request).await?;

        if let Some(variables) = &request.input.variables {
            if version.input_variables_schema.is_none() && !matches!(variables, Value::Null) {
                return Err(GatewayError::BadRequest(
                    "Input variables are provided but the version does not support them".into(),
                ));
            }
        }

        self.versions.put_if_absent(version.clone()).await?;

        self.runner.run_streaming(&version, &request.input, context).await
    }

    async fn models(&self) -> Result<Vec<ModelData>> {
        self.models.list().await
    }
}
