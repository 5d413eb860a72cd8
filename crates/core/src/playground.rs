//! Playground orchestrator (spec §4.5): fans a cartesian product of
//! models/temperatures/prompts/tool-lists/output-schemas out against a set
//! of inputs, deduplicating `Version`s by their content-hash id and caching
//! completions per policy.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::{
    domain::{AgentInput, CachePolicy, Experiment, ExperimentCompletionState, Message, Role, Version},
    error::{GatewayError, Result},
    repository::CompletionQueryStore,
    request::RequestContext,
    runner::Runner,
};

/// Everything that varies across the cartesian product, plus the fields a
/// `Version` needs that don't (tool choice, provider pin, penalties, ...),
/// supplied once as `base_version` and overridden per combination.
pub struct PlaygroundRequest {
    pub agent_id: String,
    pub base_version: Version,
    pub completion_query: Option<String>,
    pub inputs: Vec<AgentInput>,
    pub models: Vec<String>,
    pub temperatures: Vec<Option<f32>>,
    pub prompts: Vec<Vec<Message>>,
    pub tool_lists: Vec<Vec<String>>,
    pub output_schemas: Vec<Option<Value>>,
    pub cache_policy: CachePolicy,
}

type CacheKey = (String, String);

pub struct Playground<'a> {
    pub runner: &'a Runner<'a>,
    completions: Mutex<HashMap<CacheKey, Arc<crate::domain::AgentCompletion>>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<Notify>>>,
}

impl<'a> Playground<'a> {
    pub fn new(runner: &'a Runner<'a>) -> Self {
        Self { runner, completions: Mutex::new(HashMap::new()), in_flight: Mutex::new(HashMap::new()) }
    }

    /// Run the full playground operation and return the populated
    /// experiment (spec §4.5 steps 1-6).
    pub async fn run(
        &self,
        request: PlaygroundRequest,
        context: &RequestContext,
        query_store: Option<&dyn CompletionQueryStore>,
    ) -> Result<Experiment> {
        let (prompts, inputs) = self.resolve_inputs(&request, query_store).await?;

        if inputs.is_empty() {
            return Err(GatewayError::BadRequest("playground run has no inputs".into()));
        }
        let inputs: Vec<AgentInput> = inputs.into_iter().map(AgentInput::with_id).collect();

        let versions = build_versions(&request, &prompts);

        if versions.iter().any(|v| v.prompt.is_empty()) && inputs.iter().any(AgentInput::is_empty) {
            return Err(GatewayError::BadRequest(
                "a version with an empty prompt paired with an input with no messages would produce zero messages".into(),
            ));
        }

        let mut experiment = Experiment {
            id: uuid::Uuid::now_v7().to_string(),
            agent_id: request.agent_id.clone(),
            title: String::new(),
            description: String::new(),
            author: String::new(),
            metadata: Value::Null,
            cache_policy: request.cache_policy,
            inputs: Default::default(),
            versions: Default::default(),
            completions: Default::default(),
        };

        for input in &inputs {
            experiment.add_input(input.clone());
        }
        for version in &versions {
            experiment.add_version(version.clone());
        }

        let mut pending = FuturesUnordered::new();
        for version in &versions {
            for input in &inputs {
                pending.push(self.run_one(request.cache_policy, &request.agent_id, version, input, context));
            }
        }

        while let Some((version_id, input_id, state)) = pending.next().await {
            experiment.completions.insert((version_id, input_id), state);
        }

        Ok(experiment)
    }

    async fn resolve_inputs(
        &self,
        request: &PlaygroundRequest,
        query_store: Option<&dyn CompletionQueryStore>,
    ) -> Result<(Vec<Vec<Message>>, Vec<AgentInput>)> {
        if let Some(query) = &request.completion_query {
            let store = query_store
                .ok_or_else(|| GatewayError::BadRequest("completion_query was set but no completions store was provided".into()))?;
            let rows = store.query(query).await?;
            if rows.is_empty() {
                return Err(GatewayError::BadRequest("completion_query returned no rows".into()));
            }
            return Ok((request.prompts.clone(), rows));
        }

        if !request.inputs.is_empty() {
            return Ok((request.prompts.clone(), request.inputs.clone()));
        }

        if !request.prompts.is_empty() {
            return Ok(derive_inputs_from_prompts(&request.prompts));
        }

        Ok((request.prompts.clone(), vec![]))
    }

    async fn run_one(
        &self,
        cache_policy: CachePolicy,
        agent_id: &str,
        version: &Version,
        input: &AgentInput,
        context: &RequestContext,
    ) -> (String, String, ExperimentCompletionState) {
        let completion = self.run_cached(cache_policy, agent_id, version, input, context).await;

        let state = match &completion.output {
            crate::domain::CompletionOutput::Error { error } => ExperimentCompletionState::Failed(error.clone()),
            crate::domain::CompletionOutput::Success { .. } => ExperimentCompletionState::Completed(Box::new((*completion).clone())),
        };

        (version.id.clone(), input.id.clone(), state)
    }

    /// Single-flight completion cache: concurrent callers for the same
    /// `(version, input)` pair share one runner invocation instead of
    /// duplicating the upstream call (spec §9 "cache policies... avoid
    /// duplicate concurrent work for the same pair").
    async fn run_cached(
        &self,
        policy: CachePolicy,
        agent_id: &str,
        version: &Version,
        input: &AgentInput,
        context: &RequestContext,
    ) -> Arc<crate::domain::AgentCompletion> {
        let key = (version.id.clone(), input.id.clone());
        let cacheable = policy.allows_cache(version);

        if cacheable && let Some(hit) = self.completions.lock().await.get(&key) {
            return hit.clone();
        }

        let waited_on_leader = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key).cloned() {
                Some(notify) => Some(notify),
                None => {
                    in_flight.insert(key.clone(), Arc::new(Notify::new()));
                    None
                }
            }
        };

        if let Some(notify) = waited_on_leader {
            notify.notified().await;
            if let Some(hit) = self.completions.lock().await.get(&key) {
                return hit.clone();
            }
        }

        let completion = Arc::new(self.runner.run(agent_id, version, input, context).await);

        if cacheable {
            self.completions.lock().await.insert(key.clone(), completion.clone());
        }
        if let Some(notify) = self.in_flight.lock().await.remove(&key) {
            notify.notify_waiters();
        }

        completion
    }

    /// Poll `experiment` every 5 seconds until every completion reaches a
    /// terminal state or `max_wait_time_seconds` elapses (spec §4.5
    /// `get_experiment_outputs`).
    pub async fn get_experiment_outputs<F, Fut>(&self, max_wait_time_seconds: u64, mut reload: F) -> Result<Experiment>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Experiment>>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(max_wait_time_seconds);

        loop {
            let experiment = reload().await?;
            if experiment.all_terminal() {
                return Ok(experiment);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(format!(
                    "experiment '{}' did not complete within {max_wait_time_seconds}s",
                    experiment.id
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// Spec §4.5 step 2: when inputs aren't supplied directly, derive them from
/// the prompts' non-system tails, factoring out a common leading system
/// message into the shared prompt when every prompt shares one.
fn derive_inputs_from_prompts(prompts: &[Vec<Message>]) -> (Vec<Vec<Message>>, Vec<AgentInput>) {
    let leading_system = prompts.first().and_then(|p| p.first()).filter(|m| m.role == Role::System);

    let common_system = leading_system.filter(|candidate| {
        prompts.iter().all(|p| p.first().is_some_and(|m| m.role == Role::System && m.text_content() == candidate.text_content()))
    });

    let inputs = prompts
        .iter()
        .map(|prompt| {
            let tail = if common_system.is_some() { prompt[1..].to_vec() } else { prompt.clone() };
            AgentInput { id: String::new(), messages: Some(tail), variables: None }.with_id()
        })
        .collect();

    let common_prompt = common_system.map(|m| vec![m.clone()]).unwrap_or_default();
    (vec![common_prompt], inputs)
}

/// Spec §4.5 step 3: `models × temperatures × prompts × tool_lists ×
/// output_schemas`, deduplicated by the resulting `Version`'s content-hash
/// id.
fn build_versions(request: &PlaygroundRequest, prompts: &[Vec<Message>]) -> Vec<Version> {
    let mut seen = std::collections::BTreeSet::new();
    let mut versions = Vec::new();

    let models = non_empty_or_default(&request.models, vec![request.base_version.model.clone()]);
    let temperatures = non_empty_or_default(&request.temperatures, vec![request.base_version.temperature]);
    let prompts: Vec<Vec<Message>> = non_empty_or_default(prompts, vec![request.base_version.prompt.clone()]);
    let tool_lists = non_empty_or_default(&request.tool_lists, vec![request.base_version.enabled_tools.clone()]);
    let output_schemas = non_empty_or_default(&request.output_schemas, vec![request.base_version.output_schema.clone()]);

    for model in &models {
        for temperature in &temperatures {
            for prompt in &prompts {
                for tools in &tool_lists {
                    for output_schema in &output_schemas {
                        let version = Version {
                            model: model.clone(),
                            temperature: *temperature,
                            prompt: prompt.clone(),
                            enabled_tools: tools.clone(),
                            output_schema: output_schema.clone(),
                            ..request.base_version.clone()
                        }
                        .with_id();

                        if seen.insert(version.id.clone()) {
                            versions.push(version);
                        }
                    }
                }
            }
        }
    }

    versions
}

fn non_empty_or_default<T: Clone>(values: &[T], default: Vec<T>) -> Vec<T> {
    if values.is_empty() { default } else { values.to_vec() }
}
