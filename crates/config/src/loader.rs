use std::{collections::BTreeMap, path::Path, str::FromStr};

use secrecy::SecretString;
use serde::Deserialize;
use serde_dynamic_string::DynamicString;
use toml::Value;

use crate::{ConfigError, GatewayConfig, ProviderConfig, ProviderCredential, ProviderId};

/// TOML shape for the optional file-based overrides layered on top of the
/// environment-derived credentials. Mirrors the teacher's `{{ env.VAR }}`
/// expansion convention (`config::loader::expand_dynamic_strings`) so a
/// deployer can reference secrets indirectly instead of inlining them.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawFile {
    providers: BTreeMap<String, RawProviderOverride>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawProviderOverride {
    base_url: Option<String>,
    region: Option<String>,
    round_robin: Option<bool>,
    model_aliases: BTreeMap<String, String>,
}

/// Build a [`GatewayConfig`] from the process environment alone (spec §6.4):
/// `<VENDOR>_API_KEY`, `<VENDOR>_API_KEY_1`, `<VENDOR>_API_KEY_2`, …, and
/// `<VENDOR>_URL`.
pub fn from_env() -> GatewayConfig {
    let mut config = GatewayConfig::default();

    for provider in ProviderId::ALL {
        let entry = config.providers.entry(provider).or_default();
        entry.round_robin = provider.round_robin_by_default();
        load_env_credentials(provider, entry);

        if let Ok(url) = std::env::var(format!("{}_URL", env_prefix(provider))) {
            entry.base_url = Some(url);
        }

        if provider == ProviderId::Bedrock
            && let Ok(region) = std::env::var("AWS_REGION")
        {
            entry.region = Some(region);
        }
    }

    config
}

/// Load a TOML overrides file on top of [`from_env`], expanding `{{
/// env.VAR }}` placeholders the same way the teacher's loader does.
pub fn load<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut raw: Value = toml::from_str(&content)?;
    expand_dynamic_strings(&mut raw);

    let raw: RawFile = raw.try_into()?;
    let mut config = from_env();

    for (name, over) in raw.providers {
        let Some(provider) = ProviderId::ALL.into_iter().find(|p| p.as_str() == name) else {
            log::warn!("Ignoring overrides for unknown provider '{name}'");
            continue;
        };

        let entry = config.providers.entry(provider).or_default();

        if let Some(url) = over.base_url {
            entry.base_url = Some(url);
        }
        if let Some(region) = over.region {
            entry.region = Some(region);
        }
        if let Some(round_robin) = over.round_robin {
            entry.round_robin = round_robin;
        }
        entry.model_aliases.extend(over.model_aliases);
    }

    Ok(config)
}

fn env_prefix(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::OpenAi => "OPENAI",
        ProviderId::Anthropic => "ANTHROPIC",
        ProviderId::Google => "GOOGLE",
        ProviderId::Mistral => "MISTRAL",
        ProviderId::Fireworks => "FIREWORKS",
        ProviderId::Groq => "GROQ",
        ProviderId::AzureOpenAi => "AZURE_OPENAI",
        ProviderId::Bedrock => "AWS",
    }
}

fn load_env_credentials(provider: ProviderId, entry: &mut ProviderConfig) {
    let prefix = env_prefix(provider);

    if let Ok(key) = std::env::var(format!("{prefix}_API_KEY")) {
        entry.credentials.push(ProviderCredential {
            label: format!("{}-default", provider.as_str()),
            api_key: SecretString::from(key),
        });
    }

    for index in 1.. {
        let Ok(key) = std::env::var(format!("{prefix}_API_KEY_{index}")) else {
            break;
        };

        entry.credentials.push(ProviderCredential {
            label: format!("{}-{index}", provider.as_str()),
            api_key: SecretString::from(key),
        });
    }
}

fn expand_dynamic_strings(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Ok(expanded) = DynamicString::<String>::from_str(s) {
                *s = expanded.into_inner();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(expand_dynamic_strings),
        Value::Table(table) => table.values_mut().for_each(expand_dynamic_strings),
        _ => {}
    }
}
