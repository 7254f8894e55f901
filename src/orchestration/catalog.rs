// Built-in model catalog and the wiring from config to adapters

use super::arbiter::ResidentModel;
use super::providers::{
    Adapter, ChatProvider, ImageProvider, LocalDiffusion, OllamaChat, OllamaResidency, OpenAiAudio, OpenAiImages,
    OpenRouterChat, SpeechRecognizer, SpeechSynthesizer, Voice,
};
use super::registry::{ProviderDescriptor, ProviderRegistry};
use super::types::{Capability, ContentKind, ResourceClass};
use crate::config::{Backend, Credentials, ModelEntry, TaleforgeConfig};
use anyhow::Context;
use imagent::{StableDiffusionGenerator, StableDiffusionVersion};
use ollama::OllamaClient;
use std::sync::Arc;
use std::time::Duration;

/// Registry plus the residency hooks of its local heavy models
pub struct Catalog {
    pub registry: ProviderRegistry,
    pub residents: Vec<(String, Arc<dyn ResidentModel>)>,
}

impl Backend {
    /// Claim models of this backend make on the accelerator
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Backend::Ollama | Backend::Diffusion => ResourceClass::GpuHeavy,
            Backend::LocalAudio => ResourceClass::GpuLight,
            Backend::OpenRouter | Backend::OpenAiImages | Backend::OpenAiAudio => ResourceClass::None,
        }
    }
}

/// Models known out of the box
pub fn builtin_models(config: &TaleforgeConfig) -> Vec<ModelEntry> {
    let entry = |id: &str, backend, capability, backing: &str, name: &str| ModelEntry {
        id: id.to_string(),
        backend,
        capability,
        backing: backing.to_string(),
        display_name: Some(name.to_string()),
        structured_output: None,
    };

    vec![
        entry("gpt4o-mini", Backend::OpenRouter, Capability::Chat, "openai/gpt-4o-mini", "GPT-4o mini"),
        entry("gemini-pro", Backend::OpenRouter, Capability::Chat, "google/gemini-pro", "Gemini Pro"),
        entry("claude-3-opus", Backend::OpenRouter, Capability::Chat, "anthropic/claude-3-opus", "Claude 3 Opus"),
        entry(
            "claude-3-sonnet",
            Backend::OpenRouter,
            Capability::Chat,
            "anthropic/claude-3.5-sonnet",
            "Claude 3.5 Sonnet",
        ),
        entry("deepseek-r1", Backend::OpenRouter, Capability::Chat, "deepseek/deepseek-r1:free", "DeepSeek R1"),
        entry("gemma-3", Backend::OpenRouter, Capability::Chat, "google/gemma-3-27b-it:free", "Gemma 3 27B"),
        entry("llama", Backend::Ollama, Capability::Chat, &config.ollama.model, "Llama (local)"),
        entry("dall-e-3", Backend::OpenAiImages, Capability::Image, "dall-e-3", "DALL-E 3"),
        entry(
            "stable-diffusion",
            Backend::Diffusion,
            Capability::Image,
            &config.diffusion.version,
            "Stable Diffusion (local)",
        ),
        entry("tts-1", Backend::OpenAiAudio, Capability::TextToSpeech, "tts-1", "OpenAI TTS"),
        entry(
            "local-tts",
            Backend::LocalAudio,
            Capability::TextToSpeech,
            &config.local_audio.tts_model,
            "Local TTS",
        ),
        entry("whisper-1", Backend::OpenAiAudio, Capability::SpeechToText, "whisper-1", "Whisper"),
        entry(
            "local-whisper",
            Backend::LocalAudio,
            Capability::SpeechToText,
            &config.local_audio.stt_model,
            "Whisper (local)",
        ),
    ]
}

// One shared adapter per configured backend; None when not configured.
#[derive(Default)]
struct Backends {
    openrouter: Option<Arc<OpenRouterChat>>,
    ollama: Option<(OllamaClient, Arc<OllamaChat>)>,
    openai_images: Option<Arc<OpenAiImages>>,
    openai_audio: Option<Arc<OpenAiAudio>>,
    local_audio: Option<Arc<OpenAiAudio>>,
    diffusion: Option<Arc<LocalDiffusion<StableDiffusionGenerator>>>,
}

impl Backends {
    fn from_config(config: &TaleforgeConfig, credentials: &Credentials) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.orchestrator.provider_timeout_ms);
        let mut backends = Backends::default();

        match &credentials.openrouter_api_key {
            Some(key) => {
                let chat = OpenRouterChat::new(key.clone())
                    .with_base_url(config.openrouter.base_url.clone())
                    .with_attribution(config.openrouter.referer.clone(), config.openrouter.title.clone())
                    .with_timeout(timeout)?;
                backends.openrouter = Some(Arc::new(chat));
            }
            None => tracing::warn!("{} not set; remote chat models are unavailable", crate::config::OPENROUTER_KEY_VAR),
        }

        if config.ollama.enabled {
            let client = OllamaClient::with_base_url(config.ollama.host.clone())
                .with_timeout(Duration::from_millis(config.arbiter.inference_timeout_ms))?;
            let chat = OllamaChat::new(client.clone()).with_max_tokens(config.orchestrator.max_tokens);
            backends.ollama = Some((client, Arc::new(chat)));
        }

        match &credentials.openai_api_key {
            Some(key) => {
                let images = OpenAiImages::new(key.clone())
                    .with_base_url(config.openai.base_url.clone())
                    .with_size(config.openai.image_size.clone())
                    .with_timeout(timeout)?;
                let audio = OpenAiAudio::new(key.clone())
                    .with_base_url(config.openai.base_url.clone())
                    .with_timeout(timeout)?;
                backends.openai_images = Some(Arc::new(images));
                backends.openai_audio = Some(Arc::new(audio));
            }
            None => tracing::warn!("{} not set; remote image and audio models are unavailable", crate::config::OPENAI_KEY_VAR),
        }

        if config.local_audio.enabled {
            let voices = config
                .local_audio
                .voices
                .iter()
                .map(|id| Voice::new(id.clone(), id.clone()))
                .collect();
            let audio = OpenAiAudio::local(config.local_audio.base_url.clone()).with_voices(voices);
            backends.local_audio = Some(Arc::new(audio));
        }

        if config.diffusion.enabled {
            let version: StableDiffusionVersion = config
                .diffusion
                .version
                .parse()
                .with_context(|| format!("Unknown Stable Diffusion version '{}'", config.diffusion.version))?;
            let mut generator = StableDiffusionGenerator::new(version, config.diffusion.cpu)
                .context("Failed to initialize Stable Diffusion device")?;
            if let Some(scale) = config.diffusion.guidance_scale {
                generator = generator.with_guidance_scale(scale);
            }
            let diffusion = LocalDiffusion::new(generator).with_max_steps(config.arbiter.max_inference_steps);
            backends.diffusion = Some(Arc::new(diffusion));
        }

        Ok(backends)
    }

    fn chat(&self, backend: Backend) -> Option<Arc<dyn ChatProvider>> {
        match backend {
            Backend::OpenRouter => self.openrouter.clone().map(|c| c as Arc<dyn ChatProvider>),
            Backend::Ollama => self.ollama.as_ref().map(|(_, c)| c.clone() as Arc<dyn ChatProvider>),
            _ => None,
        }
    }

    fn image(&self, backend: Backend) -> Option<Arc<dyn ImageProvider>> {
        match backend {
            Backend::OpenAiImages => self.openai_images.clone().map(|i| i as Arc<dyn ImageProvider>),
            Backend::Diffusion => self.diffusion.clone().map(|d| d as Arc<dyn ImageProvider>),
            _ => None,
        }
    }

    fn audio(&self, backend: Backend) -> Option<Arc<OpenAiAudio>> {
        match backend {
            Backend::OpenAiAudio => self.openai_audio.clone(),
            Backend::LocalAudio => self.local_audio.clone(),
            _ => None,
        }
    }

    fn adapter(&self, entry: &ModelEntry) -> Option<Adapter> {
        match entry.capability {
            Capability::Chat => self.chat(entry.backend).map(Adapter::Chat),
            Capability::Image => self.image(entry.backend).map(Adapter::Image),
            Capability::TextToSpeech => self
                .audio(entry.backend)
                .map(|a| Adapter::Speech(a as Arc<dyn SpeechSynthesizer>)),
            Capability::SpeechToText => self
                .audio(entry.backend)
                .map(|a| Adapter::Transcribe(a as Arc<dyn SpeechRecognizer>)),
        }
    }

    fn resident(&self, entry: &ModelEntry) -> Option<Arc<dyn ResidentModel>> {
        match entry.backend {
            Backend::Ollama => self
                .ollama
                .as_ref()
                .map(|(client, _)| Arc::new(OllamaResidency::new(client.clone(), entry.backing.clone())) as Arc<dyn ResidentModel>),
            Backend::Diffusion => self.diffusion.clone().map(|d| d as Arc<dyn ResidentModel>),
            _ => None,
        }
    }
}

fn descriptor(entry: &ModelEntry) -> ProviderDescriptor {
    let class = entry.backend.resource_class();
    let descriptor = if class == ResourceClass::None {
        ProviderDescriptor::remote(entry.id.clone(), entry.capability, entry.backing.clone())
    } else {
        ProviderDescriptor::local(entry.id.clone(), entry.capability, class, entry.backing.clone())
    };
    let structured = entry
        .structured_output
        .unwrap_or(entry.backend == Backend::OpenRouter);
    descriptor
        .with_display_name(entry.display_name.clone().unwrap_or_else(|| entry.id.clone()))
        .with_structured_output(structured)
}

/// Build the registry from the built-in catalog plus `[[models]]` entries
pub fn build(config: &TaleforgeConfig, credentials: &Credentials) -> anyhow::Result<Catalog> {
    let backends = Backends::from_config(config, credentials)?;
    let mut builder = ProviderRegistry::builder();
    let mut residents = Vec::new();

    let mut entries = builtin_models(config);
    for extra in &config.models {
        match entries.iter_mut().find(|e| e.id == extra.id) {
            Some(existing) => *existing = extra.clone(),
            None => entries.push(extra.clone()),
        }
    }

    for entry in &entries {
        let Some(adapter) = backends.adapter(entry) else {
            tracing::debug!("Skipping {}: {:?} backend not configured", entry.id, entry.backend);
            continue;
        };
        builder
            .register(descriptor(entry), adapter)
            .with_context(|| format!("Invalid catalog entry '{}'", entry.id))?;
        if let Some(hook) = backends.resident(entry) {
            residents.push((entry.id.clone(), hook));
        }
    }

    let defaults = &config.orchestrator;
    builder
        .default_for(ContentKind::Text, defaults.default_text.clone())
        .default_for(ContentKind::Image, defaults.default_image.clone())
        .default_for(ContentKind::SpeechSynthesis, defaults.default_tts.clone())
        .default_for(ContentKind::SpeechRecognition, defaults.default_stt.clone());

    let registry = builder.build();
    tracing::info!("Registered {} models", registry.len());
    Ok(Catalog { registry, residents })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> TaleforgeConfig {
        let mut config = TaleforgeConfig::default();
        config.ollama.enabled = false;
        config
    }

    #[test]
    fn test_builtin_catalog_ids() {
        let config = TaleforgeConfig::default();
        let models = builtin_models(&config);
        let llama = models.iter().find(|m| m.id == "llama").unwrap();
        assert_eq!(llama.backing, "llama3.2");
        assert_eq!(llama.backend.resource_class(), ResourceClass::GpuHeavy);
        assert!(models.iter().any(|m| m.id == "claude-3-sonnet" && m.backing == "anthropic/claude-3.5-sonnet"));
        assert_eq!(Backend::LocalAudio.resource_class(), ResourceClass::GpuLight);
    }

    #[test]
    fn test_no_credentials_registers_nothing() {
        let catalog = build(&offline_config(), &Credentials::default()).unwrap();
        assert!(catalog.registry.is_empty());
        assert!(catalog.residents.is_empty());
        assert_eq!(catalog.registry.default_for(ContentKind::Text), None);
    }

    #[test]
    fn test_openrouter_key_registers_remote_chat_with_structured_output() {
        let credentials = Credentials {
            openrouter_api_key: Some("sk-or".into()),
            openai_api_key: None,
        };
        let catalog = build(&offline_config(), &credentials).unwrap();
        let registry = &catalog.registry;
        assert_eq!(registry.models(ContentKind::Text).len(), 6);
        assert_eq!(registry.default_for(ContentKind::Text), Some("gpt4o-mini"));
        assert_eq!(registry.default_for(ContentKind::Image), None);

        let gemma = registry.resolve("gemma-3", ContentKind::Text).unwrap();
        assert!(gemma.descriptor.structured_output);
        assert_eq!(gemma.descriptor.backing_identifier, "google/gemma-3-27b-it:free");
    }

    #[test]
    fn test_local_backends_register_with_resource_classes() {
        let mut config = TaleforgeConfig::default();
        config.local_audio.enabled = true;
        let catalog = build(&config, &Credentials::default()).unwrap();
        let registry = &catalog.registry;

        let llama = registry.resolve("llama", ContentKind::Text).unwrap();
        assert_eq!(llama.descriptor.resource_class, ResourceClass::GpuHeavy);
        assert!(!llama.descriptor.structured_output);
        let tts = registry.resolve("local-tts", ContentKind::SpeechSynthesis).unwrap();
        assert_eq!(tts.descriptor.resource_class, ResourceClass::GpuLight);
        assert!(registry.contains("local-whisper", ContentKind::SpeechRecognition));

        let resident: Vec<_> = catalog.residents.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(resident, vec!["llama"]);
    }

    #[test]
    fn test_extra_models_extend_and_override() {
        let mut config = offline_config();
        config.models.push(ModelEntry {
            id: "mistral-small".into(),
            backend: Backend::OpenRouter,
            capability: Capability::Chat,
            backing: "mistralai/mistral-small".into(),
            display_name: None,
            structured_output: Some(false),
        });
        config.models.push(ModelEntry {
            id: "gpt4o-mini".into(),
            backend: Backend::OpenRouter,
            capability: Capability::Chat,
            backing: "openai/gpt-4o".into(),
            display_name: None,
            structured_output: None,
        });
        let credentials = Credentials {
            openrouter_api_key: Some("k".into()),
            openai_api_key: None,
        };
        let catalog = build(&config, &credentials).unwrap();
        let mistral = catalog.registry.resolve("mistral-small", ContentKind::Text).unwrap();
        assert!(!mistral.descriptor.structured_output);
        assert_eq!(mistral.descriptor.display_name, "mistral-small");
        let gpt = catalog.registry.resolve("gpt4o-mini", ContentKind::Text).unwrap();
        assert_eq!(gpt.descriptor.backing_identifier, "openai/gpt-4o");
    }
}
