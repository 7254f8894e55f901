// Error types for the generation pipeline

use super::types::ContentKind;
use std::fmt;
use std::time::Duration;

/// Per-request pipeline stage; failures report the last one completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Validated,
    Resolved,
    Composed,
    LeaseHeld,
    ProviderInvoked,
    Moderated,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Resolved => "resolved",
            Stage::Composed => "composed",
            Stage::LeaseHeld => "lease_held",
            Stage::ProviderInvoked => "provider_invoked",
            Stage::Moderated => "moderated",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a backing model or service
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Local inference error: {0}")]
    Local(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Classify an HTTP error status returned by a provider
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => ProviderError::RateLimited(body),
            400..=499 => ProviderError::InvalidRequest(format!("{}: {}", status, body)),
            _ => ProviderError::Network(format!("{}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<ollama::OllamaError> for ProviderError {
    fn from(err: ollama::OllamaError) -> Self {
        match err {
            ollama::OllamaError::Status { status, body } => ProviderError::from_status(status, body),
            ollama::OllamaError::Network(e) => e.into(),
        }
    }
}

impl From<imagent::ImageGenError> for ProviderError {
    fn from(err: imagent::ImageGenError) -> Self {
        if err.is_caller_error() {
            ProviderError::InvalidRequest(err.to_string())
        } else {
            ProviderError::Local(err.to_string())
        }
    }
}

/// Typed failure of `generate`
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("No {kind} model available for '{model_id}'")]
    UnsupportedModel { model_id: String, kind: ContentKind },

    #[error("Provider failed after stage {stage}: {source}")]
    Provider {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("Accelerator busy after stage {stage}: no lease within {waited:?}")]
    ResourceExhausted { stage: Stage, waited: Duration },

    #[error("Timed out after stage {stage}: exceeded {after:?}")]
    Timeout { stage: Stage, after: Duration },
}

impl GenerationError {
    pub fn provider(stage: Stage, source: ProviderError) -> Self {
        GenerationError::Provider { stage, source }
    }

    /// Last stage completed before the failure
    pub fn stage(&self) -> Stage {
        match self {
            GenerationError::Validation(_) => Stage::Received,
            GenerationError::UnsupportedModel { .. } => Stage::Validated,
            GenerationError::Provider { stage, .. }
            | GenerationError::ResourceExhausted { stage, .. }
            | GenerationError::Timeout { stage, .. } => *stage,
        }
    }

    /// Whether the caller can fix this by changing the request
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GenerationError::Validation(_) | GenerationError::UnsupportedModel { .. }
        )
    }
}
