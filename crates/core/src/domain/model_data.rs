//! Model catalog entry (spec §3 "ModelData"): capability flags, context
//! limits, pricing and the ordered provider list used by the retry/fallback
//! pipeline.

use gateway_config::ProviderId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MaxTokensData {
    pub context_window: u32,
    pub max_output_tokens: u32,
}

/// Capability flags a provider adapter may need to branch on (spec §3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SupportFlags {
    pub system_messages: bool,
    pub json_mode: bool,
    pub structured_output: bool,
    pub tool_calling: bool,
    pub parallel_tool_calls: bool,
    pub temperature: bool,
    pub top_p: bool,
    pub penalties: bool,
    pub input_image: bool,
    pub input_audio: bool,
    pub input_pdf: bool,
    pub output_image: bool,
    pub output_text: bool,
}

/// Thresholded per-token pricing: `base_rate` applies below `threshold_tokens`
/// prompt tokens, `over_threshold_rate` applies at or above it (spec §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TieredRate {
    pub base_rate: f64,
    pub threshold_tokens: Option<u32>,
    pub over_threshold_rate: Option<f64>,
}

impl TieredRate {
    pub fn flat(rate: f64) -> Self {
        Self {
            base_rate: rate,
            threshold_tokens: None,
            over_threshold_rate: None,
        }
    }

    pub fn rate_for(&self, prompt_tokens: u32) -> f64 {
        match (self.threshold_tokens, self.over_threshold_rate) {
            (Some(threshold), Some(over_rate)) if prompt_tokens >= threshold => over_rate,
            _ => self.base_rate,
        }
    }
}

/// Pricing table for one model (spec §4.4). All per-token rates are USD per
/// token; per-image/per-second rates are USD per unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt_text_per_token: TieredRate,
    pub completion_text_per_token: TieredRate,
    /// Fraction discounted off `prompt_text_per_token` for cached tokens,
    /// e.g. `0.5` means cached tokens cost half.
    pub cached_token_discount: f64,
    pub per_image: Option<TieredRate>,
    pub completion_per_image: Option<TieredRate>,
    /// Per-token price when audio is billed like text.
    pub prompt_audio_per_token: Option<f64>,
    /// Per-second price when audio is billed by duration.
    pub prompt_audio_per_second: Option<f64>,
}

/// Reasoning-effort to token-budget mapping for models that take a numeric
/// budget rather than a named effort level.
pub type ReasoningBudgetTable = std::collections::BTreeMap<super::version::ReasoningEffort, u32>;

/// One entry in a model's ordered provider list (spec §3: "ordered list of
/// providers with per-provider overrides").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderEntry {
    pub provider: ProviderId,
    /// Upstream model name, if different from the catalog id.
    pub model_name_override: Option<String>,
}

/// Which model to fall back to per error class (spec §4.2 step 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackMap {
    pub content_moderation: Option<String>,
    pub structured_output: Option<String>,
    pub context_exceeded: Option<String>,
    pub rate_limit: Option<String>,
    pub unknown_error: Option<String>,
}

impl FallbackMap {
    pub fn get(&self, bucket: crate::error::FallbackBucket) -> Option<&str> {
        use crate::error::FallbackBucket::*;

        match bucket {
            ContentModeration => self.content_moderation.as_deref(),
            StructuredOutput => self.structured_output.as_deref(),
            ContextExceeded => self.context_exceeded.as_deref(),
            RateLimit => self.rate_limit.as_deref(),
            UnknownError => self.unknown_error.as_deref().or(self.rate_limit.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelData {
    pub id: String,
    pub max_tokens: MaxTokensData,
    pub supports: SupportFlags,
    pub reasoning_budget: Option<ReasoningBudgetTable>,
    pub pricing: Pricing,
    pub providers: Vec<ModelProviderEntry>,
    pub fallback: FallbackMap,
    /// Whether this model can accept any of the named modalities, used to
    /// check a fallback candidate's modality typology (spec §4.2 step 4:
    /// "Skip if the fallback model is not supported for the task's
    /// modality typology").
    pub modalities: Vec<super::file::FileFormat>,
}

impl ModelData {
    pub fn supports_modality(&self, format: super::file::FileFormat) -> bool {
        self.modalities.contains(&format)
    }

    pub fn provider_entry(&self, provider: ProviderId) -> Option<&ModelProviderEntry> {
        self.providers.iter().find(|entry| entry.provider == provider)
    }
}
