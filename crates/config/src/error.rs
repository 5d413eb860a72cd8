use thiserror::Error;

/// Errors that can occur while loading or validating gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid model_filter regex for provider '{provider}': {source}")]
    InvalidModelFilter {
        provider: String,
        #[source]
        source: regex::Error,
    },

    #[error("provider '{0}' has no credentials configured")]
    NoCredentials(String),
}
