// Provider adapters - one small adapter per backing service
//
// Every adapter implements exactly one capability trait. Remote and local
// variants of the same capability share the trait; they are not expected to
// produce identical output.

mod diffusion;
mod ollama;
mod openai;
mod openrouter;

pub use diffusion::LocalDiffusion;
pub use ollama::{OllamaChat, OllamaResidency};
pub use openai::{OpenAiAudio, OpenAiImages};
pub use openrouter::OpenRouterChat;

use super::error::ProviderError;
use super::types::Capability;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Sampling parameters for chat completions
#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend to constrain output to a JSON object
    pub json: bool,
}

impl ChatParams {
    /// Story turns and image-prompt writing
    pub fn narrative(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.7,
            json: false,
        }
    }

    /// Second-pass moderation calls
    pub fn moderation(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.5,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Parameters for image synthesis
#[derive(Debug, Clone, PartialEq)]
pub struct ImageParams {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            steps: 20,
            negative_prompt: None,
            seed: None,
        }
    }
}

/// A selectable speech voice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
}

impl Voice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Chat-completion backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        backing: &str,
        system: &str,
        user: &str,
        params: &ChatParams,
    ) -> Result<String, ProviderError>;
}

/// Image synthesis backend; returns encoded image bytes
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn image(&self, backing: &str, prompt: &str, params: &ImageParams) -> Result<Vec<u8>, ProviderError>;
}

/// Text-to-speech backend; returns encoded audio bytes
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(
        &self,
        backing: &str,
        text: &str,
        voice: Option<&str>,
        language: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError>;

    fn voices(&self) -> Vec<Voice>;

    /// MIME type of the audio `speak` returns
    fn mime(&self) -> &str {
        "audio/mpeg"
    }
}

/// Speech-to-text backend
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(&self, backing: &str, audio: &[u8], language: Option<&str>) -> Result<String, ProviderError>;
}

/// Capability-tagged adapter handle stored in the registry
#[derive(Clone)]
pub enum Adapter {
    Chat(Arc<dyn ChatProvider>),
    Image(Arc<dyn ImageProvider>),
    Speech(Arc<dyn SpeechSynthesizer>),
    Transcribe(Arc<dyn SpeechRecognizer>),
}

impl Adapter {
    pub fn capability(&self) -> Capability {
        match self {
            Adapter::Chat(_) => Capability::Chat,
            Adapter::Image(_) => Capability::Image,
            Adapter::Speech(_) => Capability::TextToSpeech,
            Adapter::Transcribe(_) => Capability::SpeechToText,
        }
    }

    pub fn as_chat(&self) -> Option<&Arc<dyn ChatProvider>> {
        match self {
            Adapter::Chat(chat) => Some(chat),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Arc<dyn ImageProvider>> {
        match self {
            Adapter::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_speech(&self) -> Option<&Arc<dyn SpeechSynthesizer>> {
        match self {
            Adapter::Speech(speech) => Some(speech),
            _ => None,
        }
    }

    pub fn as_transcriber(&self) -> Option<&Arc<dyn SpeechRecognizer>> {
        match self {
            Adapter::Transcribe(transcriber) => Some(transcriber),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Adapter::{:?}", self.capability())
    }
}
