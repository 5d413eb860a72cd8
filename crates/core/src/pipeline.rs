//! Retry/fallback pipeline (spec §4.2): computes the ordered sequence of
//! provider attempts for one request and decides, after each error, whether
//! to retry the same provider, move to the next one, fall back to another
//! model, or give up.
//!
//! The pipeline never talks to a provider directly — it only hands out
//! [`PlannedAttempt`] descriptors (provider id, credential label, resolved
//! model name, call options). Building the actual [`crate::provider::Provider`]
//! and invoking it is the runner's job, which keeps this module testable
//! without a network.

use std::collections::VecDeque;

use gateway_config::{GatewayConfig, ProviderCredential, ProviderId};
use rand::seq::SliceRandom;

use crate::{
    domain::{FileFormat, ModelData, UseFallback, Version},
    error::GatewayError,
    provider::CallOptions,
};

/// Looks up catalog entries for fallback models by id. The pipeline only
/// ever needs this one operation, so the runner can hand over whatever
/// backs its model catalog (in-memory map, repository, cache) without the
/// pipeline depending on its storage shape.
pub trait ModelCatalog: Send + Sync {
    fn get(&self, model_id: &str) -> Option<ModelData>;
}

/// One attempt the runner should make: which provider, which configured
/// credential, which upstream model name, and the call options to send.
#[derive(Debug, Clone)]
pub struct PlannedAttempt {
    pub provider_id: ProviderId,
    pub credential_label: String,
    pub model_name: String,
    pub options: CallOptions,
    pub model_data: ModelData,
}

pub enum PipelineStep {
    Attempt(PlannedAttempt),
    Exhausted(ExhaustionReason),
}

pub enum ExhaustionReason {
    /// No provider anywhere in the chain (original model or fallback) had a
    /// configured credential. Carries the ready-to-raise error (spec §8
    /// property 10).
    NoProvider(GatewayError),
    /// At least one attempt was made and failed; the runner should raise
    /// [`Pipeline::first_error`] (spec §4.2: "raises the first recorded
    /// error so users see the most informative one").
    OutOfAttempts,
}

struct ProviderSlot {
    provider_id: ProviderId,
    model_name: String,
    credentials: Vec<ProviderCredential>,
}

enum FallbackStage {
    /// `UseFallback::Auto`: the single bucket-driven fallback has not been
    /// tried yet.
    AutoPending,
    Models(VecDeque<String>),
    Stopped,
}

pub struct Pipeline<'a> {
    config: &'a GatewayConfig,
    catalog: &'a dyn ModelCatalog,
    version: &'a Version,
    required_modality: Option<FileFormat>,
    base_options: CallOptions,

    current_model_data: ModelData,
    queue: VecDeque<ProviderSlot>,
    current_slot: Option<ProviderSlot>,
    cred_idx: usize,
    attempts_on_current_provider: u32,
    structured_retry_used: bool,
    force_structured_off_next: bool,
    mode_retry_used: bool,
    force_tools_off_next: bool,

    fallback_stage: FallbackStage,
    last_error: Option<GatewayError>,
    first_error: Option<GatewayError>,
    any_attempt_yielded: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        version: &'a Version,
        model_data: ModelData,
        base_options: CallOptions,
        config: &'a GatewayConfig,
        catalog: &'a dyn ModelCatalog,
        required_modality: Option<FileFormat>,
    ) -> Self {
        let queue = build_queue(version, &model_data, config);

        let fallback_stage = match &version.use_fallback {
            UseFallback::Never => FallbackStage::Stopped,
            UseFallback::Auto => FallbackStage::AutoPending,
            UseFallback::Models(models) => FallbackStage::Models(models.iter().cloned().collect()),
        };

        Self {
            config,
            catalog,
            version,
            required_modality,
            base_options,
            current_model_data: model_data,
            queue,
            current_slot: None,
            cred_idx: 0,
            attempts_on_current_provider: 0,
            structured_retry_used: false,
            force_structured_off_next: false,
            mode_retry_used: false,
            force_tools_off_next: false,
            fallback_stage,
            last_error: None,
            first_error: None,
            any_attempt_yielded: false,
        }
    }

    /// The first recorded error across the whole pipeline run, surfaced
    /// when the pipeline exhausts without success (spec §4.2, §4.3).
    pub fn first_error(&self) -> Option<&GatewayError> {
        self.first_error.as_ref()
    }

    /// Pull the next attempt to make. Call once up front, then call
    /// [`Pipeline::retry_after_error`] for every subsequent attempt.
    pub fn next(&mut self) -> PipelineStep {
        loop {
            if self.current_slot.is_none() {
                match self.queue.pop_front() {
                    Some(slot) => {
                        self.current_slot = Some(slot);
                        self.cred_idx = 0;
                        self.attempts_on_current_provider = 0;
                        self.structured_retry_used = false;
                        self.mode_retry_used = false;
                    }
                    None => return self.exhaust_current_model(),
                }
            }

            let slot = self.current_slot.as_ref().expect("just populated");
            if self.cred_idx >= slot.credentials.len() {
                self.current_slot = None;
                continue;
            }

            self.any_attempt_yielded = true;
            return PipelineStep::Attempt(self.build_attempt());
        }
    }

    /// Report the error from the last yielded attempt and pull the next
    /// one (spec §4.2 "Yield order").
    pub fn retry_after_error(&mut self, error: GatewayError) -> PipelineStep {
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
        self.last_error = Some(error.clone());

        // One-shot same-provider retry with structured generation forced
        // off (spec §4.2, §8 property 4), only when the Version did not
        // explicitly require it.
        if !self.structured_retry_used
            && !self.version.use_structured_generation
            && matches!(
                error,
                GatewayError::StructuredGenerationError(_) | GatewayError::InvalidGeneration(_) | GatewayError::FailedGeneration(_)
            )
        {
            self.structured_retry_used = true;
            self.force_structured_off_next = true;
            self.attempts_on_current_provider += 1;
            return PipelineStep::Attempt(self.build_attempt());
        }

        // One-shot same-provider retry with tools stripped out (spec §4.1
        // "Unsupported parameter tools ... retry without structured
        // generation once" generalised to the parameter actually rejected).
        if !self.mode_retry_used && matches!(error, GatewayError::ModelDoesNotSupportMode(_)) {
            self.mode_retry_used = true;
            self.force_tools_off_next = true;
            self.attempts_on_current_provider += 1;
            return PipelineStep::Attempt(self.build_attempt());
        }

        let policy = error.policy();
        self.attempts_on_current_provider += 1;

        if policy.try_next_provider {
            log::debug!("moving to next provider after error: {error}");
            self.current_slot = None;
            return self.next();
        }

        if policy.retry && self.attempts_on_current_provider < policy.max_attempt_count.unwrap_or(0) {
            if let Some(slot) = &self.current_slot
                && self.cred_idx + 1 < slot.credentials.len()
            {
                self.cred_idx += 1;
            }
            return PipelineStep::Attempt(self.build_attempt());
        }

        // Neither retryable in place nor eligible to try the next provider:
        // the whole original-model phase stops here (spec §4.2: "move to
        // the next provider only if the last error is should_try_next_provider").
        self.queue.clear();
        self.current_slot = None;
        self.exhaust_current_model()
    }

    fn build_attempt(&mut self) -> PlannedAttempt {
        let slot = self.current_slot.as_ref().expect("slot present");
        let credential = &slot.credentials[self.cred_idx];

        let mut options = self.base_options.clone();
        options.model = slot.model_name.clone();
        if self.force_structured_off_next {
            options.structured_generation = false;
            self.force_structured_off_next = false;
        }
        if self.force_tools_off_next {
            options.tools.clear();
            options.tool_choice = None;
            self.force_tools_off_next = false;
        }

        PlannedAttempt {
            provider_id: slot.provider_id,
            credential_label: credential.label.clone(),
            model_name: slot.model_name.clone(),
            options,
            model_data: self.current_model_data.clone(),
        }
    }

    /// The original model's (or the current fallback model's) provider
    /// queue is empty. Either raise `NoProviderSupportingModel` (zero
    /// attempts ever made), try a fallback model, or give up.
    fn exhaust_current_model(&mut self) -> PipelineStep {
        if !self.any_attempt_yielded {
            return self.no_provider_error();
        }

        let Some(last_error) = self.last_error.clone() else {
            return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts);
        };

        loop {
            match &mut self.fallback_stage {
                FallbackStage::Stopped => return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts),
                FallbackStage::AutoPending => {
                    self.fallback_stage = FallbackStage::Stopped;
                    let Some(bucket) = last_error.fallback_bucket() else {
                        return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts);
                    };
                    let Some(candidate) = self.current_model_data.fallback.get(bucket).map(str::to_string) else {
                        return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts);
                    };
                    log::warn!(
                        "model '{}' exhausted, falling back to '{candidate}' ({})",
                        self.current_model_data.id,
                        bucket.as_str()
                    );
                    if let Some(step) = self.start_fallback_model(&candidate) {
                        return step;
                    }
                    // candidate unsupported for the task's modality: no
                    // further auto-fallback attempts are allowed.
                    return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts);
                }
                FallbackStage::Models(models) => match models.pop_front() {
                    Some(candidate) => {
                        if let Some(step) = self.start_fallback_model(&candidate) {
                            return step;
                        }
                        // unsupported candidate: fall through and try the
                        // next one in the user-supplied list.
                    }
                    None => {
                        self.fallback_stage = FallbackStage::Stopped;
                        return PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts);
                    }
                },
            }
        }
    }

    fn start_fallback_model(&mut self, model_id: &str) -> Option<PipelineStep> {
        let model_data = self.catalog.get(model_id)?;

        if let Some(modality) = self.required_modality
            && !model_data.supports_modality(modality)
        {
            return None;
        }

        self.current_model_data = model_data.clone();
        self.queue = build_queue(self.version, &model_data, self.config);
        self.current_slot = None;
        self.last_error = None;
        Some(self.next())
    }

    fn no_provider_error(&self) -> PipelineStep {
        let candidates = self
            .current_model_data
            .providers
            .iter()
            .map(|entry| (entry.provider.to_string(), entry.provider.env_var().to_string()))
            .collect();

        PipelineStep::Exhausted(ExhaustionReason::NoProvider(GatewayError::NoProviderSupportingModel {
            model: self.current_model_data.id.clone(),
            candidates,
        }))
    }
}

/// Build the provider queue for one model, in the order spec §4.2 describes:
/// custom per-model configs first, then either the pinned provider alone or
/// the catalog's ordered provider list.
fn build_queue(version: &Version, model_data: &ModelData, config: &GatewayConfig) -> VecDeque<ProviderSlot> {
    let mut queue = VecDeque::new();

    for (provider_id, provider_config) in &config.providers {
        if model_data.provider_entry(*provider_id).is_some() {
            continue;
        }
        let Some(model_name) = provider_config.model_aliases.get(&model_data.id) else {
            continue;
        };
        if provider_config.is_configured() {
            queue.push_back(ProviderSlot {
                provider_id: *provider_id,
                model_name: model_name.clone(),
                credentials: ordered_credentials(provider_config),
            });
        }
    }

    if let Some(pinned) = version.provider {
        // Pinning replaces the catalog's default ordered provider list
        // (the loop below), not the custom per-model configs added above
        // (spec §4.2 "Yield order": step 1 is independent of step 2) —
        // drop only a pre-existing entry for the pinned provider itself so
        // it isn't attempted twice.
        queue.retain(|slot| slot.provider_id != pinned);
        if let Some(provider_config) = config.provider(pinned) {
            let model_name = model_data
                .provider_entry(pinned)
                .and_then(|entry| entry.model_name_override.clone())
                .unwrap_or_else(|| provider_config.resolve_model_name(&model_data.id).to_string());

            if provider_config.is_configured() {
                queue.push_back(ProviderSlot {
                    provider_id: pinned,
                    model_name,
                    credentials: ordered_credentials(provider_config),
                });
            }
        }
        return queue;
    }

    for entry in &model_data.providers {
        let Some(provider_config) = config.provider(entry.provider) else { continue };
        if !provider_config.is_configured() {
            continue;
        }

        let model_name = entry
            .model_name_override
            .clone()
            .unwrap_or_else(|| provider_config.resolve_model_name(&model_data.id).to_string());

        queue.push_back(ProviderSlot {
            provider_id: entry.provider,
            model_name,
            credentials: ordered_credentials(provider_config),
        });
    }

    queue
}

/// First credential in its configured order (to maximise quota exhaustion
/// before moving on), remaining ones shuffled when the provider is flagged
/// round-robin (spec §4.2 step 1).
fn ordered_credentials(config: &gateway_config::ProviderConfig) -> Vec<ProviderCredential> {
    let mut credentials = config.credentials.clone();
    if config.round_robin && credentials.len() > 1 {
        let (_first, rest) = credentials.split_at_mut(1);
        rest.shuffle(&mut rand::rng());
    }
    credentials
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gateway_config::{ProviderConfig, ProviderCredential};
    use secrecy::SecretString;

    use super::*;
    use crate::domain::{FallbackMap, MaxTokensData, ModelProviderEntry, Pricing, SupportFlags, TieredRate};

    struct FakeCatalog(BTreeMap<String, ModelData>);

    impl ModelCatalog for FakeCatalog {
        fn get(&self, model_id: &str) -> Option<ModelData> {
            self.0.get(model_id).cloned()
        }
    }

    fn credential(label: &str) -> ProviderCredential {
        ProviderCredential { label: label.to_string(), api_key: SecretString::from(label.to_string()) }
    }

    fn configured(label: &str) -> ProviderConfig {
        ProviderConfig { credentials: vec![credential(label)], ..Default::default() }
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

    fn model(id: &str, providers: Vec<ProviderId>) -> ModelData {
        ModelData {
            id: id.to_string(),
            max_tokens: MaxTokensData::default(),
            supports: SupportFlags::default(),
            reasoning_budget: None,
            pricing: pricing(),
            providers: providers
                .into_iter()
                .map(|provider| ModelProviderEntry { provider, model_name_override: None })
                .collect(),
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
            prompt: vec![],
            input_variables_schema: None,
            output_schema: None,
            structured_generation: true,
            use_structured_generation: false,
            reasoning_effort: None,
            reasoning_budget: None,
            use_fallback: UseFallback::Auto,
        }
    }

    fn call_options() -> CallOptions {
        CallOptions {
            model: String::new(),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            parallel_tool_calls: None,
            tools: vec![],
            tool_choice: None,
            output_schema: None,
            structured_generation: true,
            reasoning_effort: None,
            reasoning_budget: None,
            stream: false,
        }
    }

    #[test]
    fn provider_order_is_respected_with_two_attempts_on_the_first_provider() {
        let version = base_version();
        let model_data = model("m", vec![ProviderId::OpenAi, ProviderId::Anthropic]);
        let mut config = GatewayConfig::default();
        config.providers.insert(ProviderId::OpenAi, configured("openai-default"));
        config.providers.insert(ProviderId::Anthropic, configured("anthropic-default"));
        let catalog = FakeCatalog(BTreeMap::new());

        let mut pipeline = Pipeline::new(&version, model_data, call_options(), &config, &catalog, None);

        let mut order = vec![];
        let attempt = match pipeline.next() {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected an attempt"),
        };
        order.push(attempt.provider_id);

        let attempt = match pipeline.retry_after_error(GatewayError::RateLimit("slow down".into())) {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected a retry on the same provider"),
        };
        order.push(attempt.provider_id);

        let attempt = match pipeline.retry_after_error(GatewayError::ProviderUnavailable("down".into())) {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected to move to the next provider"),
        };
        order.push(attempt.provider_id);

        assert_eq!(order, vec![ProviderId::OpenAi, ProviderId::OpenAi, ProviderId::Anthropic]);
    }

    /// Spec §4.2 "Yield order": a pinned provider (step 2) only replaces the
    /// catalog's default provider list (step 3), it doesn't erase the
    /// custom per-model `model_aliases` configs from step 1.
    #[test]
    fn pinned_provider_is_appended_after_custom_config_entries() {
        let version = {
            let mut v = base_version();
            v.provider = Some(ProviderId::Anthropic);
            v
        };
        let model_data = model("m", vec![ProviderId::OpenAi]);

        let mut config = GatewayConfig::default();
        config.providers.insert(ProviderId::OpenAi, configured("openai-default"));

        let mut custom = configured("fireworks-default");
        custom.model_aliases.insert("m".to_string(), "accounts/fireworks/models/m".to_string());
        config.providers.insert(ProviderId::Fireworks, custom);

        config.providers.insert(ProviderId::Anthropic, configured("anthropic-default"));

        let catalog = FakeCatalog(BTreeMap::new());
        let mut pipeline = Pipeline::new(&version, model_data, call_options(), &config, &catalog, None);

        let first = match pipeline.next() {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected an attempt"),
        };
        assert_eq!(first.provider_id, ProviderId::Fireworks);

        let second = match pipeline.retry_after_error(GatewayError::ProviderUnavailable("down".into())) {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected to move to the pinned provider"),
        };
        assert_eq!(second.provider_id, ProviderId::Anthropic);
    }

    #[test]
    fn auto_fallback_is_attempted_at_most_once() {
        let mut version = base_version();
        version.use_fallback = UseFallback::Auto;

        let mut primary = model("primary", vec![ProviderId::OpenAi]);
        primary.fallback.rate_limit = Some("fallback".to_string());
        let fallback = model("fallback", vec![ProviderId::Anthropic]);

        let mut config = GatewayConfig::default();
        config.providers.insert(ProviderId::OpenAi, configured("openai-default"));
        config.providers.insert(ProviderId::Anthropic, configured("anthropic-default"));

        let mut catalog_map = BTreeMap::new();
        catalog_map.insert("fallback".to_string(), fallback);
        let catalog = FakeCatalog(catalog_map);

        let mut pipeline = Pipeline::new(&version, primary, call_options(), &config, &catalog, None);

        let mut providers_seen = vec![];
        let mut step = pipeline.next();
        loop {
            match step {
                PipelineStep::Attempt(attempt) => {
                    providers_seen.push(attempt.provider_id);
                    step = pipeline.retry_after_error(GatewayError::RateLimit("slow down".into()));
                }
                PipelineStep::Exhausted(_) => break,
            }
        }

        // Three retries exhaust OpenAI (max_attempt_count = 3), one fallback
        // attempt on Anthropic exhausts it too, then the pipeline stops —
        // it never reattempts a second fallback.
        assert_eq!(providers_seen.iter().filter(|p| **p == ProviderId::OpenAi).count(), 3);
        assert_eq!(providers_seen.iter().filter(|p| **p == ProviderId::Anthropic).count(), 3);
    }

    #[test]
    fn structured_generation_error_retries_same_provider_exactly_once_with_it_disabled() {
        let version = base_version();
        let model_data = model("m", vec![ProviderId::OpenAi]);
        let mut config = GatewayConfig::default();
        config.providers.insert(ProviderId::OpenAi, configured("openai-default"));
        let catalog = FakeCatalog(BTreeMap::new());

        let mut pipeline = Pipeline::new(&version, model_data, call_options(), &config, &catalog, None);

        let first = match pipeline.next() {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected an attempt"),
        };
        assert!(first.options.structured_generation);

        let retry = match pipeline.retry_after_error(GatewayError::StructuredGenerationError("bad schema".into())) {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected a same-provider retry"),
        };
        assert_eq!(retry.provider_id, ProviderId::OpenAi);
        assert!(!retry.options.structured_generation);

        let step = pipeline.retry_after_error(GatewayError::StructuredGenerationError("bad schema again".into()));
        assert!(matches!(step, PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts)));
    }

    /// Spec §4.1 "Unsupported parameter tools ... ModelDoesNotSupportMode":
    /// the same one-shot-then-give-up shape as the structured-generation
    /// retry, but stripping `tools`/`tool_choice` instead.
    #[test]
    fn model_does_not_support_mode_error_retries_once_with_tools_stripped() {
        let version = base_version();
        let model_data = model("m", vec![ProviderId::OpenAi]);
        let mut config = GatewayConfig::default();
        config.providers.insert(ProviderId::OpenAi, configured("openai-default"));
        let catalog = FakeCatalog(BTreeMap::new());

        let mut options = call_options();
        options.tools = vec![crate::domain::Tool { name: "lookup".into(), description: None, input_schema: serde_json::json!({}), output_schema: None, strict: false }];

        let mut pipeline = Pipeline::new(&version, model_data, options, &config, &catalog, None);

        let first = match pipeline.next() {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected an attempt"),
        };
        assert_eq!(first.options.tools.len(), 1);

        let retry = match pipeline.retry_after_error(GatewayError::ModelDoesNotSupportMode("tools not supported".into())) {
            PipelineStep::Attempt(a) => a,
            _ => panic!("expected a same-provider retry"),
        };
        assert_eq!(retry.provider_id, ProviderId::OpenAi);
        assert!(retry.options.tools.is_empty());

        let step = pipeline.retry_after_error(GatewayError::ModelDoesNotSupportMode("still unsupported".into()));
        assert!(matches!(step, PipelineStep::Exhausted(ExhaustionReason::OutOfAttempts)));
    }

    #[test]
    fn no_configured_credentials_raises_no_provider_supporting_model() {
        let version = base_version();
        let model_data = model("m", vec![ProviderId::OpenAi]);
        let config = GatewayConfig::default();
        let catalog = FakeCatalog(BTreeMap::new());

        let mut pipeline = Pipeline::new(&version, model_data, call_options(), &config, &catalog, None);

        match pipeline.next() {
            PipelineStep::Exhausted(ExhaustionReason::NoProvider(GatewayError::NoProviderSupportingModel {
                model,
                candidates,
            })) => {
                assert_eq!(model, "m");
                assert_eq!(candidates, vec![("openai".to_string(), "OPENAI_API_KEY".to_string())]);
            }
            _ => panic!("expected NoProviderSupportingModel"),
        }
    }
}
