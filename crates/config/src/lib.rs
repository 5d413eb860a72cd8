//! Gateway configuration: provider credentials, base URLs and rate-limit
//! hints, loaded from the environment and an optional TOML overrides file.

mod error;
mod loader;
mod providers;

use indexmap::IndexMap;

pub use error::ConfigError;
pub use loader::{from_env, load};
pub use providers::{ProviderConfig, ProviderCredential, ProviderId, RateLimitHint};

/// Read-only configuration snapshot shared by every adapter and by the
/// retry/fallback pipeline. Built once at startup (spec §5: "Model catalog,
/// pricing tables, credential config: read-only after init").
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub providers: IndexMap<ProviderId, ProviderConfig>,
}

impl GatewayConfig {
    pub fn provider(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(&id)
    }

    pub fn is_configured(&self, id: ProviderId) -> bool {
        self.provider(id).is_some_and(ProviderConfig::is_configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_loader_picks_up_indexed_credentials() {
        // SAFETY: tests run single-threaded within this process for env manipulation.
        unsafe {
            std::env::set_var("FIREWORKS_API_KEY", "primary");
            std::env::set_var("FIREWORKS_API_KEY_1", "secondary");
        }

        let config = from_env();
        let fireworks = config.provider(ProviderId::Fireworks).expect("configured");

        assert_eq!(fireworks.credentials.len(), 2);
        assert!(fireworks.round_robin);

        unsafe {
            std::env::remove_var("FIREWORKS_API_KEY");
            std::env::remove_var("FIREWORKS_API_KEY_1");
        }
    }
}
