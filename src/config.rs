//! Configuration file support for taleforge

use crate::orchestration::types::Capability;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const OPENROUTER_KEY_VAR: &str = "OPENROUTER_API_KEY";
pub const OPENAI_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaleforgeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub local_audio: LocalAudioConfig,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    /// Models added on top of the built-in catalog
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_text_model")]
    pub default_text: String,

    #[serde(default = "default_image_model")]
    pub default_image: String,

    #[serde(default = "default_tts_model")]
    pub default_tts: String,

    #[serde(default = "default_stt_model")]
    pub default_stt: String,

    /// Reject unknown model ids instead of falling back to the default
    #[serde(default)]
    pub strict_models: bool,

    /// Chat model that turns story scenes into image prompts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt_writer: Option<String>,

    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,

    /// Diffusion step budget
    #[serde(default = "default_max_inference_steps")]
    pub max_inference_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,

    #[serde(default = "default_referer")]
    pub referer: String,

    #[serde(default = "default_title")]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_url")]
    pub base_url: String,

    #[serde(default = "default_image_size")]
    pub image_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ollama_host")]
    pub host: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAudioConfig {
    #[serde(default)]
    pub enabled: bool,

    /// OpenAI-compatible audio server
    #[serde(default = "default_local_audio_url")]
    pub base_url: String,

    #[serde(default = "default_local_tts_model")]
    pub tts_model: String,

    #[serde(default = "default_local_stt_model")]
    pub stt_model: String,

    /// Voice ids the server offers; empty means the OpenAI set
    #[serde(default)]
    pub voices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sd_version")]
    pub version: String,

    /// Run on CPU even when an accelerator is present
    #[serde(default)]
    pub cpu: bool,

    #[serde(default = "default_image_side")]
    pub width: usize,

    #[serde(default = "default_image_side")]
    pub height: usize,

    #[serde(default = "default_steps")]
    pub steps: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
}

/// Backing service for a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[serde(rename = "openrouter")]
    OpenRouter,
    Ollama,
    #[serde(rename = "openai_images")]
    OpenAiImages,
    Diffusion,
    #[serde(rename = "openai_audio")]
    OpenAiAudio,
    LocalAudio,
}

/// Extra model registered from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub backend: Backend,
    pub capability: Capability,
    /// Name the backing service knows the model by
    pub backing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<bool>,
}

/// API keys, read from the environment rather than the config file
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub openrouter_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            openrouter_api_key: env_key(OPENROUTER_KEY_VAR),
            openai_api_key: env_key(OPENAI_KEY_VAR),
        }
    }
}

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

// Defaults

fn default_text_model() -> String {
    "gpt4o-mini".to_string()
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

fn default_max_tokens() -> u32 {
    500
}

fn default_lease_timeout_ms() -> u64 {
    120_000
}

fn default_inference_timeout_ms() -> u64 {
    300_000
}

fn default_max_inference_steps() -> usize {
    50
}

fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_referer() -> String {
    "http://localhost:3000".to_string()
}

fn default_title() -> String {
    "AI Dungeon Master".to_string()
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

fn default_local_audio_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_local_tts_model() -> String {
    "kokoro".to_string()
}

fn default_local_stt_model() -> String {
    "whisper-small".to_string()
}

fn default_sd_version() -> String {
    "v1.5".to_string()
}

fn default_image_side() -> usize {
    512
}

fn default_steps() -> usize {
    20
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_text: default_text_model(),
            default_image: default_image_model(),
            default_tts: default_tts_model(),
            default_stt: default_stt_model(),
            strict_models: false,
            image_prompt_writer: None,
            provider_timeout_ms: default_provider_timeout_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: default_lease_timeout_ms(),
            inference_timeout_ms: default_inference_timeout_ms(),
            max_inference_steps: default_max_inference_steps(),
        }
    }
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_openrouter_url(),
            referer: default_referer(),
            title: default_title(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            image_size: default_image_size(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_ollama_host(),
            model: default_ollama_model(),
        }
    }
}

impl Default for LocalAudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_local_audio_url(),
            tts_model: default_local_tts_model(),
            stt_model: default_local_stt_model(),
            voices: Vec::new(),
        }
    }
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            version: default_sd_version(),
            cpu: false,
            width: default_image_side(),
            height: default_image_side(),
            steps: default_steps(),
            guidance_scale: None,
        }
    }
}

impl TaleforgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: TaleforgeConfig =
            toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Explicit path if given, else the default location when it exists, else built-in defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            _ => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `<config dir>/taleforge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("taleforge").join("config.toml"))
    }
}
