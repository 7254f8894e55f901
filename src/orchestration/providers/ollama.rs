// Local text models served by Ollama

use super::{ChatParams, ChatProvider};
use crate::orchestration::arbiter::ResidentModel;
use crate::orchestration::error::ProviderError;
use async_trait::async_trait;
use ollama::{GenerateOptions, GenerateRequest, OllamaClient};

/// Chat adapter over Ollama's `/api/generate`
#[derive(Clone)]
pub struct OllamaChat {
    client: OllamaClient,
    max_tokens: u32,
}

impl OllamaChat {
    pub fn new(client: OllamaClient) -> Self {
        Self {
            client,
            max_tokens: 500,
        }
    }

    /// Upper bound on generated tokens regardless of what callers ask for
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ChatProvider for OllamaChat {
    async fn complete(
        &self,
        backing: &str,
        system: &str,
        user: &str,
        params: &ChatParams,
    ) -> Result<String, ProviderError> {
        let mut request = GenerateRequest::new(backing, user).with_options(GenerateOptions {
            temperature: params.temperature,
            top_p: 0.9,
            num_predict: params.max_tokens.min(self.max_tokens) as i32,
        });
        if !system.is_empty() {
            request = request.with_system(system);
        }
        if params.json {
            request = request.json();
        }

        let response = self.client.generate(&request).await?;
        if response.done_reason.as_deref() == Some("length") {
            tracing::debug!("{} stopped at the token limit", backing);
        }
        Ok(response.response.trim().to_string())
    }
}

/// Residency control for one Ollama model
pub struct OllamaResidency {
    client: OllamaClient,
    model: String,
}

impl OllamaResidency {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ResidentModel for OllamaResidency {
    async fn offload(&self) -> Result<(), ProviderError> {
        Ok(self.client.unload(&self.model).await?)
    }

    async fn restore(&self) -> Result<(), ProviderError> {
        Ok(self.client.load(&self.model).await?)
    }
}
