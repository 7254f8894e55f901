// Provider registry - model id to descriptor and adapter, built once at startup

use super::providers::Adapter;
use super::types::{Capability, ContentKind, Locality, ResourceClass};
use serde::Serialize;
use std::collections::HashMap;

/// Static facts about one selectable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub model_id: String,
    pub display_name: String,
    pub capability: Capability,
    pub locality: Locality,
    pub resource_class: ResourceClass,
    /// Identifier the backing service knows the model by
    pub backing_identifier: String,
    /// Whether the model can be asked for JSON output
    pub structured_output: bool,
}

impl ProviderDescriptor {
    /// Remote API model; never touches the local accelerator
    pub fn remote(model_id: impl Into<String>, capability: Capability, backing: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            display_name: model_id.clone(),
            model_id,
            capability,
            locality: Locality::RemoteApi,
            resource_class: ResourceClass::None,
            backing_identifier: backing.into(),
            structured_output: false,
        }
    }

    /// Locally hosted model with the given claim on the accelerator
    pub fn local(
        model_id: impl Into<String>,
        capability: Capability,
        resource_class: ResourceClass,
        backing: impl Into<String>,
    ) -> Self {
        Self {
            locality: Locality::LocalInference,
            resource_class,
            ..Self::remote(model_id, capability, backing)
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_structured_output(mut self, structured_output: bool) -> Self {
        self.structured_output = structured_output;
        self
    }

    pub fn is_local(&self) -> bool {
        self.locality == Locality::LocalInference
    }
}

/// Descriptor paired with the adapter that serves it
#[derive(Debug, Clone)]
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    pub adapter: Adapter,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Model '{model_id}' is not registered for {kind}")]
    NotFound { model_id: String, kind: ContentKind },

    #[error("No default model configured for {0}")]
    NoDefault(ContentKind),

    #[error("Model '{model_id}' declares {declared:?} but its adapter provides {actual:?}")]
    CapabilityMismatch {
        model_id: String,
        declared: Capability,
        actual: Capability,
    },

    #[error("Model '{0}' registered twice")]
    Duplicate(String),
}

/// Collects providers before the registry is frozen
#[derive(Default)]
pub struct RegistryBuilder {
    providers: HashMap<String, RegisteredProvider>,
    defaults: HashMap<ContentKind, String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ProviderDescriptor, adapter: Adapter) -> Result<&mut Self, RegistryError> {
        if descriptor.capability != adapter.capability() {
            return Err(RegistryError::CapabilityMismatch {
                model_id: descriptor.model_id,
                declared: descriptor.capability,
                actual: adapter.capability(),
            });
        }
        if self.providers.contains_key(&descriptor.model_id) {
            return Err(RegistryError::Duplicate(descriptor.model_id));
        }
        tracing::debug!(
            "Registered {} ({:?}, {:?}) -> {}",
            descriptor.model_id,
            descriptor.capability,
            descriptor.locality,
            descriptor.backing_identifier
        );
        self.providers
            .insert(descriptor.model_id.clone(), RegisteredProvider { descriptor, adapter });
        Ok(self)
    }

    /// Model used when a request names none or an unknown one
    pub fn default_for(&mut self, kind: ContentKind, model_id: impl Into<String>) -> &mut Self {
        self.defaults.insert(kind, model_id.into());
        self
    }

    pub fn build(self) -> ProviderRegistry {
        let mut defaults = HashMap::new();
        for (kind, model_id) in self.defaults {
            match self.providers.get(&model_id) {
                Some(p) if p.descriptor.capability == kind.capability() => {
                    defaults.insert(kind, model_id);
                }
                _ => tracing::warn!("Default {} model '{}' is not available; {} requests need an explicit model", kind, model_id, kind),
            }
        }
        ProviderRegistry {
            providers: self.providers,
            defaults,
        }
    }
}

/// Read-only model catalog shared by every request
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
    defaults: HashMap<ContentKind, String>,
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Exact lookup; the model must serve `kind`
    pub fn resolve(&self, model_id: &str, kind: ContentKind) -> Result<&RegisteredProvider, RegistryError> {
        self.providers
            .get(model_id)
            .filter(|p| p.descriptor.capability == kind.capability())
            .ok_or_else(|| RegistryError::NotFound {
                model_id: model_id.to_string(),
                kind,
            })
    }

    /// Lookup that falls back to the kind's default instead of failing
    pub fn resolve_or_default(
        &self,
        model_id: Option<&str>,
        kind: ContentKind,
    ) -> Result<&RegisteredProvider, RegistryError> {
        if let Some(model_id) = model_id {
            match self.resolve(model_id, kind) {
                Ok(provider) => return Ok(provider),
                Err(_) => tracing::warn!("Unknown {} model '{}', using default", kind, model_id),
            }
        }
        let default = self.defaults.get(&kind).ok_or(RegistryError::NoDefault(kind))?;
        tracing::debug!("Using default {} model {}", kind, default);
        self.resolve(default, kind)
    }

    pub fn contains(&self, model_id: &str, kind: ContentKind) -> bool {
        self.resolve(model_id, kind).is_ok()
    }

    pub fn default_for(&self, kind: ContentKind) -> Option<&str> {
        self.defaults.get(&kind).map(String::as_str)
    }

    pub fn get(&self, model_id: &str) -> Option<&RegisteredProvider> {
        self.providers.get(model_id)
    }

    /// Descriptors serving `kind`, sorted by model id
    pub fn models(&self, kind: ContentKind) -> Vec<&ProviderDescriptor> {
        let mut models: Vec<_> = self
            .providers
            .values()
            .map(|p| &p.descriptor)
            .filter(|d| d.capability == kind.capability())
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    pub fn providers(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::providers::testing::{RecordingImage, ScriptedChat};
    use std::sync::Arc;

    fn chat() -> Adapter {
        Adapter::Chat(Arc::new(ScriptedChat::default()))
    }

    fn registry() -> ProviderRegistry {
        let mut builder = ProviderRegistry::builder();
        builder
            .register(ProviderDescriptor::remote("gpt4o-mini", Capability::Chat, "openai/gpt-4o-mini"), chat())
            .unwrap()
            .register(
                ProviderDescriptor::local("llama", Capability::Chat, ResourceClass::GpuHeavy, "llama3.2"),
                chat(),
            )
            .unwrap()
            .register(
                ProviderDescriptor::remote("dall-e-3", Capability::Image, "dall-e-3"),
                Adapter::Image(Arc::new(RecordingImage::default())),
            )
            .unwrap();
        builder
            .default_for(ContentKind::Text, "gpt4o-mini")
            .default_for(ContentKind::Image, "dall-e-3")
            .default_for(ContentKind::SpeechSynthesis, "tts-1");
        builder.build()
    }

    #[test]
    fn test_resolve_exact_and_wrong_kind() {
        let registry = registry();
        assert_eq!(
            registry.resolve("llama", ContentKind::Text).unwrap().descriptor.backing_identifier,
            "llama3.2"
        );
        assert_eq!(
            registry.resolve("llama", ContentKind::Image).unwrap_err(),
            RegistryError::NotFound {
                model_id: "llama".into(),
                kind: ContentKind::Image
            }
        );
    }

    #[test]
    fn test_unknown_or_mismatched_ids_fall_back_to_default() {
        let registry = registry();
        for id in [None, Some("gpt-9"), Some("dall-e-3"), Some("")] {
            let provider = registry.resolve_or_default(id, ContentKind::Text).unwrap();
            assert_eq!(provider.descriptor.model_id, "gpt4o-mini");
        }
    }

    #[test]
    fn test_dangling_default_is_dropped() {
        let registry = registry();
        assert_eq!(registry.default_for(ContentKind::SpeechSynthesis), None);
        assert_eq!(
            registry.resolve_or_default(Some("tts-1"), ContentKind::SpeechSynthesis).unwrap_err(),
            RegistryError::NoDefault(ContentKind::SpeechSynthesis)
        );
    }

    #[test]
    fn test_register_rejects_mismatch_and_duplicates() {
        let mut builder = RegistryBuilder::new();
        let err = builder
            .register(ProviderDescriptor::remote("dall-e-3", Capability::Image, "dall-e-3"), chat())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::CapabilityMismatch { .. }));

        builder
            .register(ProviderDescriptor::remote("gemini-pro", Capability::Chat, "google/gemini-pro"), chat())
            .unwrap();
        let err = builder
            .register(ProviderDescriptor::remote("gemini-pro", Capability::Chat, "google/gemini-pro"), chat())
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::Duplicate("gemini-pro".into()));
    }

    #[test]
    fn test_models_are_sorted_per_kind() {
        let registry = registry();
        let ids: Vec<_> = registry
            .models(ContentKind::Text)
            .into_iter()
            .map(|d| d.model_id.as_str())
            .collect();
        assert_eq!(ids, vec!["gpt4o-mini", "llama"]);
        assert!(registry.models(ContentKind::SpeechRecognition).is_empty());
        assert!(registry.contains("dall-e-3", ContentKind::Image));
        assert_eq!(registry.len(), 3);
    }
}
