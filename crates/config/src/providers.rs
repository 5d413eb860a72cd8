use std::{collections::BTreeMap, fmt};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Identifies one of the upstream model providers the gateway can route to.
///
/// Kept as a closed enum (teacher: `ProviderType`) rather than a bare string
/// so that a typo in a config file or a routing decision fails to compile or
/// deserialize instead of silently landing on "unknown provider".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
    Fireworks,
    Groq,
    AzureOpenAi,
    Bedrock,
}

impl ProviderId {
    /// All providers the gateway knows how to build an adapter for, in the
    /// fixed order used when a `Version` does not pin a provider (spec §4.2
    /// step 3 walks `model.providers` in this catalog order).
    pub const ALL: [ProviderId; 8] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Mistral,
        ProviderId::Fireworks,
        ProviderId::Groq,
        ProviderId::AzureOpenAi,
        ProviderId::Bedrock,
    ];

    /// Short lowercase identifier, used both as the config-file key and as
    /// the prefix accepted in `model` strings (`anthropic/claude-3-opus`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Mistral => "mistral",
            ProviderId::Fireworks => "fireworks",
            ProviderId::Groq => "groq",
            ProviderId::AzureOpenAi => "azure-openai",
            ProviderId::Bedrock => "bedrock",
        }
    }

    /// Name of the primary environment variable this provider reads its API
    /// key from (spec §6.4). Used both by the env loader and to build the
    /// `NoProviderSupportingModel` hint (spec §4.2 step 4, §8 property 10).
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OPENAI_API_KEY",
            ProviderId::Anthropic => "ANTHROPIC_API_KEY",
            ProviderId::Google => "GOOGLE_API_KEY",
            ProviderId::Mistral => "MISTRAL_API_KEY",
            ProviderId::Fireworks => "FIREWORKS_API_KEY",
            ProviderId::Groq => "GROQ_API_KEY",
            ProviderId::AzureOpenAi => "AZURE_OPENAI_API_KEY",
            ProviderId::Bedrock => "AWS_ACCESS_KEY_ID",
        }
    }

    /// Whether this vendor's credentials should be shuffled per request to
    /// spread load across keys (spec §4.2 step 1: "round-robin" providers
    /// such as Fireworks), instead of always trying the first key first.
    pub fn round_robin_by_default(&self) -> bool {
        matches!(self, ProviderId::Fireworks)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured API credential for a provider. Multiple credentials for
/// the same provider enable round-robin quota spreading (spec §6.4 indexed
/// keys, §4.2 step 1).
#[derive(Clone)]
pub struct ProviderCredential {
    pub label: String,
    pub api_key: SecretString,
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential").field("label", &self.label).finish()
    }
}

/// Rate-limit hints reported for a provider or model. Enforcement beyond
/// this reporting is out of scope (spec §1 Non-goals: "no multi-tenant
/// scheduling fairness beyond per-provider rate-limit reporting").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitHint {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u32>,
}

/// Per-provider configuration: credentials, base URL override, and any
/// explicitly renamed/aliased models.
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub credentials: Vec<ProviderCredential>,
    pub base_url: Option<String>,
    pub round_robin: bool,
    pub rate_limits: Option<RateLimitHint>,
    /// Bedrock-only: the AWS region to target.
    pub region: Option<String>,
    /// Model id aliases, map of gateway-facing name to upstream name.
    pub model_aliases: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.credentials.is_empty()
    }

    pub fn resolve_model_name<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_aliases.get(model).map(String::as_str).unwrap_or(model)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("credentials", &self.credentials.len())
            .field("base_url", &self.base_url)
            .field("round_robin", &self.round_robin)
            .field("region", &self.region)
            .finish()
    }
}
