//! Canonical error taxonomy (spec §7) shared by every provider adapter, the
//! retry/fallback pipeline and the runner.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// One error kind from the taxonomy in spec §7. Each variant carries the
/// provider-reported detail message plus whatever structured payload the
/// caller needs (e.g. the list of providers that would have supported a
/// model, for [`GatewayError::NoProviderSupportingModel`]).
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "code", content = "details")]
pub enum GatewayError {
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("provider internal error: {0}")]
    ProviderInternalError(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("maximum context length exceeded: {0}")]
    MaxTokensExceeded(String),
    #[error("structured generation error: {0}")]
    StructuredGenerationError(String),
    #[error("invalid generation: {0}")]
    InvalidGeneration(String),
    #[error("failed generation: {0}")]
    FailedGeneration(String),

    #[error("content moderation: {0}")]
    ContentModeration(String),
    #[error("task banned: {0}")]
    TaskBanned(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("model does not support mode: {0}")]
    ModelDoesNotSupportMode(String),

    #[error("missing model: {0}")]
    MissingModel(String),
    #[error("no provider supports model '{model}'")]
    NoProviderSupportingModel {
        model: String,
        /// `(provider, required env var)` pairs that would otherwise have
        /// supported the model (spec §4.2 step 4, §8 property 10).
        candidates: Vec<(String, String)>,
    },
    #[error("invalid provider configuration: {0}")]
    InvalidProviderConfig(String),

    #[error("maximum tool call iterations exceeded")]
    MaxToolCallIteration,
    #[error("agent run failed: {0}")]
    AgentRunFailed(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("run is unpriceable: {0}")]
    UnpriceableRun(String),
}

/// Static policy attached to an error kind (spec §7): whether it should be
/// recorded for billing/observability, whether the pipeline may retry past
/// it, an optional attempt cap, and whether a corrective message must be
/// appended to the conversation before the retry.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPolicy {
    pub status_code: u16,
    pub capture: bool,
    pub retry: bool,
    pub max_attempt_count: Option<u32>,
    pub add_exception_to_messages: bool,
    /// Whether the pipeline should move to the next provider for the same
    /// model before falling back to a different model entirely (spec §4.2
    /// step 3: "move to the next provider only if the last error is
    /// should_try_next_provider").
    pub try_next_provider: bool,
}

impl GatewayError {
    pub fn policy(&self) -> ErrorPolicy {
        use GatewayError::*;

        match self {
            RateLimit(_) => ErrorPolicy {
                status_code: 429,
                capture: true,
                retry: true,
                max_attempt_count: Some(3),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            ProviderInternalError(_) | ProviderUnavailable(_) | ReadTimeout(_) | Timeout(_) => ErrorPolicy {
                status_code: 503,
                capture: true,
                retry: true,
                max_attempt_count: Some(2),
                add_exception_to_messages: false,
                try_next_provider: true,
            },
            MaxTokensExceeded(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: true,
            },
            StructuredGenerationError(_) | InvalidGeneration(_) | FailedGeneration(_) => ErrorPolicy {
                status_code: 422,
                capture: true,
                retry: true,
                max_attempt_count: Some(1),
                add_exception_to_messages: true,
                try_next_provider: false,
            },
            ContentModeration(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: true,
            },
            TaskBanned(_) => ErrorPolicy {
                status_code: 403,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            InvalidFile(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            BadRequest(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            ModelDoesNotSupportMode(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: true,
                max_attempt_count: Some(1),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            MissingModel(_) => ErrorPolicy {
                status_code: 404,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: true,
            },
            NoProviderSupportingModel { .. } => ErrorPolicy {
                status_code: 404,
                capture: false,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            InvalidProviderConfig(_) => ErrorPolicy {
                status_code: 500,
                capture: false,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: true,
            },
            MaxToolCallIteration | AgentRunFailed(_) => ErrorPolicy {
                status_code: 400,
                capture: true,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            InternalError(_) => ErrorPolicy {
                status_code: 500,
                capture: false,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
            UnpriceableRun(_) => ErrorPolicy {
                status_code: 200,
                capture: false,
                retry: false,
                max_attempt_count: Some(0),
                add_exception_to_messages: false,
                try_next_provider: false,
            },
        }
    }

    /// Whether a provider would normally charge for this failure (spec §7:
    /// "When a provider reports a cost-incurring error ... otherwise false
    /// and cost is forced to 0").
    pub fn provider_request_incurs_cost(&self) -> bool {
        matches!(
            self,
            GatewayError::MaxTokensExceeded(_)
                | GatewayError::StructuredGenerationError(_)
                | GatewayError::InvalidGeneration(_)
                | GatewayError::FailedGeneration(_)
                | GatewayError::ContentModeration(_)
        )
    }

    /// Which fallback bucket (spec §4.2 step 4) this error routes to when
    /// the original model's providers are exhausted. `None` means "stop,
    /// do not attempt any fallback model".
    pub fn fallback_bucket(&self) -> Option<FallbackBucket> {
        use GatewayError::*;

        match self {
            ContentModeration(_) => Some(FallbackBucket::ContentModeration),
            StructuredGenerationError(_) | InvalidGeneration(_) | FailedGeneration(_) => {
                Some(FallbackBucket::StructuredOutput)
            }
            MaxTokensExceeded(_) => Some(FallbackBucket::ContextExceeded),
            InvalidFile(_) | MaxToolCallIteration | TaskBanned(_) | BadRequest(_) | AgentRunFailed(_) => None,
            RateLimit(_) | ProviderInternalError(_) | ProviderUnavailable(_) | ReadTimeout(_) | Timeout(_) => {
                Some(FallbackBucket::RateLimit)
            }
            _ => Some(FallbackBucket::UnknownError),
        }
    }
}

/// The named fallback slots on [`crate::domain::ModelData::fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackBucket {
    ContentModeration,
    StructuredOutput,
    ContextExceeded,
    RateLimit,
    UnknownError,
}

impl FallbackBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackBucket::ContentModeration => "content_moderation",
            FallbackBucket::StructuredOutput => "structured_output",
            FallbackBucket::ContextExceeded => "context_exceeded",
            FallbackBucket::RateLimit => "rate_limit",
            FallbackBucket::UnknownError => "unknown_error",
        }
    }
}
