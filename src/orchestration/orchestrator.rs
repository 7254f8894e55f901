// Orchestrator - one request in, one artifact out
//
// validate -> resolve -> compose -> [lease] -> provider -> [moderate] -> artifact

use super::arbiter::{ArbiterError, ArbiterStats, DeviceHold, ResourceArbiter};
use super::catalog;
use super::composer::PromptComposer;
use super::error::{GenerationError, ProviderError, Stage};
use super::moderation::{ModerationDomain, ModerationGate};
use super::providers::{ChatParams, ChatProvider, ImageParams, Voice};
use super::registry::{ProviderDescriptor, ProviderRegistry, RegisteredProvider};
use super::types::{
    Artifact, ArtifactContent, ComposedPrompt, ContentKind, GenerationRequest, Locality, NarratorTurn, Payload,
    ResourceClass, Role,
};
use crate::config::{Credentials, TaleforgeConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Knobs that shape every request
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Reject unknown model ids instead of using the kind's default
    pub strict_models: bool,
    /// Chat model that turns a composed scene into an image prompt
    pub image_prompt_writer: Option<String>,
    pub provider_timeout: Duration,
    pub inference_timeout: Duration,
    pub max_tokens: u32,
    /// Size and step defaults for image calls
    pub image: ImageParams,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            strict_models: false,
            image_prompt_writer: None,
            provider_timeout: Duration::from_secs(60),
            inference_timeout: Duration::from_secs(300),
            max_tokens: 500,
            image: ImageParams::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &TaleforgeConfig) -> Self {
        Self {
            strict_models: config.orchestrator.strict_models,
            image_prompt_writer: config
                .orchestrator
                .image_prompt_writer
                .clone()
                .filter(|w| !w.trim().is_empty()),
            provider_timeout: Duration::from_millis(config.orchestrator.provider_timeout_ms),
            inference_timeout: Duration::from_millis(config.arbiter.inference_timeout_ms),
            max_tokens: config.orchestrator.max_tokens,
            image: ImageParams {
                width: config.diffusion.width,
                height: config.diffusion.height,
                steps: config.diffusion.steps,
                negative_prompt: None,
                seed: None,
            },
        }
    }
}

/// Entry in the model listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub locality: Locality,
    pub resource_class: ResourceClass,
    pub default: bool,
}

/// Liveness and accelerator state
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub started_at: String,
    pub uptime_secs: i64,
    pub models: usize,
    pub leases: ArbiterStats,
}

/// Generation orchestrator shared by every request
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    arbiter: Arc<ResourceArbiter>,
    composer: PromptComposer,
    settings: OrchestratorSettings,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, arbiter: ResourceArbiter, settings: OrchestratorSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            arbiter: Arc::new(arbiter),
            composer: PromptComposer::new(),
            settings,
            started_at: Utc::now(),
        }
    }

    /// Wire registry, adapters and arbiter from configuration
    pub fn from_config(config: &TaleforgeConfig, credentials: &Credentials) -> anyhow::Result<Self> {
        let catalog = catalog::build(config, credentials)?;
        let mut arbiter = ResourceArbiter::new(Duration::from_millis(config.arbiter.lease_timeout_ms));
        for (model_id, hook) in catalog.residents {
            arbiter = arbiter.with_resident(model_id, hook);
        }
        Ok(Self::new(catalog.registry, arbiter, OrchestratorSettings::from_config(config)))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one request to completion
    pub async fn generate(&self, request: GenerationRequest) -> Result<Artifact, GenerationError> {
        let span = tracing::info_span!(
            "generate",
            kind = %request.content_kind,
            model = tracing::field::Empty,
            stage = tracing::field::Empty,
        );
        async move {
            let result = self.run(&request).await;
            let span = tracing::Span::current();
            match &result {
                Ok(artifact) => {
                    span.record("stage", Stage::Completed.as_str());
                    tracing::info!(substituted = artifact.substituted, "Generated {}", artifact.kind());
                }
                Err(e) => {
                    span.record("stage", e.stage().as_str());
                    if e.is_user_error() {
                        tracing::warn!("Rejected request: {}", e);
                    } else {
                        tracing::error!("Generation failed: {}", e);
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &GenerationRequest) -> Result<Artifact, GenerationError> {
        validate(request)?;
        let provider = self.resolve(request)?;
        tracing::Span::current().record("model", provider.descriptor.model_id.as_str());

        let composed = self.composer.compose(request, &provider.descriptor);
        tracing::debug!(
            "Composed prompt: {} chars directive, {} chars content",
            composed.system_directive.len(),
            composed.user_content.len()
        );

        match request.content_kind {
            ContentKind::Text => self.narrate(request, provider, &composed).await,
            ContentKind::Image => self.illustrate(request, provider, &composed).await,
            ContentKind::SpeechSynthesis => self.speak(request, provider, &composed).await,
            ContentKind::SpeechRecognition => self.transcribe(request, provider).await,
        }
    }

    fn resolve(&self, request: &GenerationRequest) -> Result<&RegisteredProvider, GenerationError> {
        let kind = request.content_kind;
        let requested = request.model_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
        let unsupported = || GenerationError::UnsupportedModel {
            model_id: requested.unwrap_or("(default)").to_string(),
            kind,
        };

        if self.settings.strict_models {
            if let Some(model_id) = requested {
                return self.registry.resolve(model_id, kind).map_err(|_| unsupported());
            }
        }
        self.registry
            .resolve_or_default(requested, kind)
            .map_err(|_| unsupported())
    }

    async fn narrate(
        &self,
        request: &GenerationRequest,
        provider: &RegisteredProvider,
        composed: &ComposedPrompt,
    ) -> Result<Artifact, GenerationError> {
        let descriptor = &provider.descriptor;
        let chat = provider.adapter.as_chat().ok_or_else(|| mismatch(descriptor))?;
        let structured = descriptor.structured_output && request.role == Role::Narrator;
        let params = ChatParams::narrative(self.settings.max_tokens).with_json(structured);

        let reply = self
            .call(
                descriptor,
                Stage::Composed,
                chat.complete(
                    &descriptor.backing_identifier,
                    &composed.system_directive,
                    &composed.user_content,
                    &params,
                ),
            )
            .await?;
        let mut text = strip_speaker_tag(&reply).to_string();

        let mut substituted = false;
        if request.safety_mode {
            let judge = self.bounded(chat, descriptor);
            let verdict = ModerationGate::new(&judge, &descriptor.backing_identifier, descriptor.structured_output)
                .with_max_tokens(self.settings.max_tokens)
                .moderate(&text, ModerationDomain::Text)
                .await;
            substituted = !verdict.accepted;
            text = verdict.apply(text);
        }

        let turn = match request.role {
            Role::Narrator => NarratorTurn::parse(&text),
            Role::Character => None,
        };
        Ok(Artifact::new(&descriptor.model_id, ArtifactContent::Text { text, turn }).with_substitution(substituted))
    }

    async fn illustrate(
        &self,
        request: &GenerationRequest,
        provider: &RegisteredProvider,
        composed: &ComposedPrompt,
    ) -> Result<Artifact, GenerationError> {
        let descriptor = &provider.descriptor;
        let image = provider.adapter.as_image().ok_or_else(|| mismatch(descriptor))?;
        let writer = self.image_prompt_writer();

        let mut prompt = composed.render();
        if let Some(writer) = writer {
            let chat = writer.adapter.as_chat().ok_or_else(|| mismatch(&writer.descriptor))?;
            let written = self
                .call(
                    &writer.descriptor,
                    Stage::Composed,
                    chat.complete(
                        &writer.descriptor.backing_identifier,
                        &composed.system_directive,
                        &composed.user_content,
                        &ChatParams::narrative(self.settings.max_tokens),
                    ),
                )
                .await?;
            if written.trim().is_empty() {
                tracing::warn!("{} wrote an empty image prompt, using the scene", writer.descriptor.model_id);
            } else {
                prompt = written.trim().to_string();
            }
        }

        let mut stage = Stage::Composed;
        let mut substituted = false;
        if request.safety_mode {
            match writer.or_else(|| self.registry.resolve_or_default(None, ContentKind::Text).ok()) {
                Some(judge_provider) => {
                    if let Some(chat) = judge_provider.adapter.as_chat() {
                        let judge_descriptor = &judge_provider.descriptor;
                        let judge = self.bounded(chat, judge_descriptor);
                        let verdict = ModerationGate::new(
                            &judge,
                            &judge_descriptor.backing_identifier,
                            judge_descriptor.structured_output,
                        )
                        .with_max_tokens(self.settings.max_tokens)
                        .moderate(&prompt, ModerationDomain::ImagePrompt)
                        .await;
                        substituted = !verdict.accepted;
                        prompt = verdict.apply(prompt);
                        stage = Stage::Moderated;
                    }
                }
                None => tracing::warn!("No chat model available to moderate the image prompt"),
            }
        }

        let mut params = self.settings.image.clone();
        if descriptor.is_local() {
            params.negative_prompt = Some(self.composer.negative_prompt(request));
        }
        let png = self
            .call(descriptor, stage, image.image(&descriptor.backing_identifier, &prompt, &params))
            .await?;

        Ok(Artifact::new(&descriptor.model_id, ArtifactContent::Image { png, prompt }).with_substitution(substituted))
    }

    async fn speak(
        &self,
        request: &GenerationRequest,
        provider: &RegisteredProvider,
        composed: &ComposedPrompt,
    ) -> Result<Artifact, GenerationError> {
        let descriptor = &provider.descriptor;
        let speech = provider.adapter.as_speech().ok_or_else(|| mismatch(descriptor))?;
        let bytes = self
            .call(
                descriptor,
                Stage::Composed,
                speech.speak(
                    &descriptor.backing_identifier,
                    &composed.user_content,
                    request.voice(),
                    request.language(),
                ),
            )
            .await?;
        let mime = speech.mime().to_string();
        Ok(Artifact::new(&descriptor.model_id, ArtifactContent::Audio { bytes, mime }))
    }

    async fn transcribe(
        &self,
        request: &GenerationRequest,
        provider: &RegisteredProvider,
    ) -> Result<Artifact, GenerationError> {
        let descriptor = &provider.descriptor;
        let transcriber = provider.adapter.as_transcriber().ok_or_else(|| mismatch(descriptor))?;
        let Payload::Audio { bytes } = &request.payload else {
            return Err(GenerationError::Validation("Transcription needs audio".into()));
        };
        let text = self
            .call(
                descriptor,
                Stage::Composed,
                transcriber.transcribe(&descriptor.backing_identifier, bytes, request.language()),
            )
            .await?;
        Ok(Artifact::new(&descriptor.model_id, ArtifactContent::Transcript { text }))
    }

    fn image_prompt_writer(&self) -> Option<&RegisteredProvider> {
        let writer = self.settings.image_prompt_writer.as_deref()?;
        match self.registry.resolve(writer, ContentKind::Text) {
            Ok(provider) => Some(provider),
            Err(e) => {
                tracing::warn!("Image prompt writer unavailable: {}", e);
                None
            }
        }
    }

    /// Invoke a provider under a lease and the matching time bound
    async fn call<T>(
        &self,
        descriptor: &ProviderDescriptor,
        after: Stage,
        invocation: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, GenerationError> {
        let lease = self
            .arbiter
            .acquire(descriptor.resource_class, &descriptor.model_id)
            .await
            .map_err(|e| match e {
                ArbiterError::Exhausted { waited } => GenerationError::ResourceExhausted { stage: after, waited },
            })?;
        let stage = if descriptor.resource_class == ResourceClass::None {
            after
        } else {
            Stage::LeaseHeld
        };
        let limit = self.limit_for(descriptor);

        tracing::debug!("Invoking {} ({})", descriptor.model_id, descriptor.backing_identifier);
        let result = tokio::time::timeout(limit, DeviceHold::scope(lease.hold(), invocation)).await;
        self.arbiter.release(lease);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(GenerationError::provider(stage, source)),
            Err(_) => Err(GenerationError::Timeout { stage, after: limit }),
        }
    }

    fn limit_for(&self, descriptor: &ProviderDescriptor) -> Duration {
        if descriptor.is_local() {
            self.settings.inference_timeout
        } else {
            self.settings.provider_timeout
        }
    }

    fn bounded<'a>(&'a self, chat: &'a Arc<dyn ChatProvider>, descriptor: &'a ProviderDescriptor) -> BoundedChat<'a> {
        BoundedChat {
            chat: chat.as_ref(),
            arbiter: &self.arbiter,
            descriptor,
            limit: self.limit_for(descriptor),
        }
    }

    /// Models serving `kind`, sorted by id
    pub fn models(&self, kind: ContentKind) -> Vec<ModelSummary> {
        let default = self.registry.default_for(kind);
        self.registry
            .models(kind)
            .into_iter()
            .map(|d| ModelSummary {
                id: d.model_id.clone(),
                name: d.display_name.clone(),
                locality: d.locality,
                resource_class: d.resource_class,
                default: default == Some(d.model_id.as_str()),
            })
            .collect()
    }

    /// Voices of a speech model (the default one when `model_id` is None)
    pub fn voices(&self, model_id: Option<&str>) -> Result<Vec<Voice>, GenerationError> {
        let mut request = GenerationRequest::speech("");
        request.model_id = model_id.map(str::to_string);
        let provider = self.resolve(&request)?;
        Ok(provider
            .adapter
            .as_speech()
            .map(|speech| speech.voices())
            .unwrap_or_default())
    }

    pub fn health(&self) -> HealthReport {
        let status = if self.registry.is_empty() { "degraded" } else { "ok" };
        HealthReport {
            status,
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            models: self.registry.len(),
            leases: self.arbiter.stats(),
        }
    }
}

/// Judge calls for moderation: leased and time-bounded like any provider call,
/// but failures surface as provider errors so the gate can fail open
struct BoundedChat<'a> {
    chat: &'a dyn ChatProvider,
    arbiter: &'a ResourceArbiter,
    descriptor: &'a ProviderDescriptor,
    limit: Duration,
}

#[async_trait]
impl<'a> ChatProvider for BoundedChat<'a> {
    async fn complete(
        &self,
        backing: &str,
        system: &str,
        user: &str,
        params: &ChatParams,
    ) -> Result<String, ProviderError> {
        let lease = self
            .arbiter
            .acquire(self.descriptor.resource_class, &self.descriptor.model_id)
            .await
            .map_err(|e| ProviderError::Local(e.to_string()))?;
        let result = tokio::time::timeout(
            self.limit,
            DeviceHold::scope(lease.hold(), self.chat.complete(backing, system, user, params)),
        )
        .await;
        drop(lease);
        result.map_err(|_| ProviderError::Timeout(format!("no reply within {:?}", self.limit)))?
    }
}

fn validate(request: &GenerationRequest) -> Result<(), GenerationError> {
    let invalid = |msg: &str| Err(GenerationError::Validation(msg.to_string()));
    match (request.content_kind, &request.payload) {
        (ContentKind::Text | ContentKind::Image, Payload::Prompt { text }) if text.trim().is_empty() => {
            invalid("Prompt is empty")
        }
        (ContentKind::Text | ContentKind::Image, Payload::Scene { action, .. }) if action.trim().is_empty() => {
            invalid("Scene action is empty")
        }
        (ContentKind::Text | ContentKind::Image, Payload::Prompt { .. } | Payload::Scene { .. }) => Ok(()),
        (ContentKind::SpeechSynthesis, Payload::Prompt { text }) if text.trim().is_empty() => {
            invalid("Nothing to speak")
        }
        (ContentKind::SpeechSynthesis, Payload::Prompt { .. }) => Ok(()),
        (ContentKind::SpeechRecognition, Payload::Audio { bytes }) if bytes.is_empty() => invalid("Audio is empty"),
        (ContentKind::SpeechRecognition, Payload::Audio { .. }) => Ok(()),
        (kind, payload) => Err(GenerationError::Validation(format!(
            "{} requests cannot take a {} payload",
            kind,
            payload.name()
        ))),
    }
}

fn mismatch(descriptor: &ProviderDescriptor) -> GenerationError {
    GenerationError::provider(
        Stage::Resolved,
        ProviderError::NotConfigured(format!("{} has no {:?} adapter", descriptor.model_id, descriptor.capability)),
    )
}

/// Drop a leading `DM:` / `Player:` speaker tag the model sometimes echoes
fn strip_speaker_tag(text: &str) -> &str {
    let text = text.trim();
    for tag in ["dm:", "player:"] {
        if let Some(head) = text.get(..tag.len()) {
            if head.eq_ignore_ascii_case(tag) {
                return text[tag.len()..].trim_start();
            }
        }
    }
    text
}
