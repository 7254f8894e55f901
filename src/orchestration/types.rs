// Core types for the generation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media a request asks for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    SpeechSynthesis,
    SpeechRecognition,
}

impl ContentKind {
    pub const ALL: [ContentKind; 4] = [
        ContentKind::Text,
        ContentKind::Image,
        ContentKind::SpeechSynthesis,
        ContentKind::SpeechRecognition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::SpeechSynthesis => "speech_synthesis",
            ContentKind::SpeechRecognition => "speech_recognition",
        }
    }

    /// Provider capability able to serve this kind
    pub fn capability(&self) -> Capability {
        match self {
            ContentKind::Text => Capability::Chat,
            ContentKind::Image => Capability::Image,
            ContentKind::SpeechSynthesis => Capability::TextToSpeech,
            ContentKind::SpeechRecognition => Capability::SpeechToText,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider can do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Image,
    SpeechToText,
    TextToSpeech,
}

/// Where a provider runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    RemoteApi,
    LocalInference,
}

/// Claim a provider makes on the local accelerator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    None,
    GpuLight,
    GpuHeavy,
}

/// Which side of the table the model plays
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    #[serde(alias = "DM")]
    Narrator,
    #[serde(alias = "Player")]
    Character,
}

impl Role {
    /// Name used for the speaker inside story prompts
    pub fn speaker(&self) -> &'static str {
        match self {
            Role::Narrator => "Dungeon Master",
            Role::Character => "Player",
        }
    }
}

/// Request input, shaped by the content kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Payload {
    /// Free prompt text (or the text to speak)
    Prompt { text: String },
    /// Recent story context plus the action being answered or illustrated
    Scene { context: String, action: String },
    /// Recorded speech
    Audio { bytes: Vec<u8> },
}

impl Payload {
    pub fn prompt(text: impl Into<String>) -> Self {
        Payload::Prompt { text: text.into() }
    }

    pub fn scene(context: impl Into<String>, action: impl Into<String>) -> Self {
        Payload::Scene {
            context: context.into(),
            action: action.into(),
        }
    }

    pub fn audio(bytes: Vec<u8>) -> Self {
        Payload::Audio { bytes }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Prompt { .. } => "prompt",
            Payload::Scene { .. } => "scene",
            Payload::Audio { .. } => "audio",
        }
    }
}

/// A single generation request as handed over by the route layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub content_kind: ContentKind,
    pub payload: Payload,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub safety_mode: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(content_kind: ContentKind, payload: Payload) -> Self {
        Self {
            content_kind,
            payload,
            model_id: None,
            safety_mode: false,
            language: None,
            role: Role::default(),
            style: None,
            theme: None,
            voice_id: None,
        }
    }

    pub fn text(payload: Payload) -> Self {
        Self::new(ContentKind::Text, payload)
    }

    pub fn image(payload: Payload) -> Self {
        Self::new(ContentKind::Image, payload)
    }

    pub fn speech(text: impl Into<String>) -> Self {
        Self::new(ContentKind::SpeechSynthesis, Payload::prompt(text))
    }

    pub fn transcription(audio: Vec<u8>) -> Self {
        Self::new(ContentKind::SpeechRecognition, Payload::audio(audio))
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_safety_mode(mut self, safety_mode: bool) -> Self {
        self.safety_mode = safety_mode;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    /// Language with blank values treated as unset
    pub fn language(&self) -> Option<&str> {
        non_blank(self.language.as_deref())
    }

    pub fn style(&self) -> Option<&str> {
        non_blank(self.style.as_deref())
    }

    pub fn theme(&self) -> Option<&str> {
        non_blank(self.theme.as_deref())
    }

    pub fn voice(&self) -> Option<&str> {
        non_blank(self.voice_id.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// System directive plus user content, assembled per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub system_directive: String,
    pub user_content: String,
}

impl ComposedPrompt {
    pub fn new(system_directive: impl Into<String>, user_content: impl Into<String>) -> Self {
        Self {
            system_directive: system_directive.into(),
            user_content: user_content.into(),
        }
    }

    /// Single-string form for providers that take one prompt
    pub fn render(&self) -> String {
        match (self.system_directive.is_empty(), self.user_content.is_empty()) {
            (true, _) => self.user_content.clone(),
            (false, true) => self.system_directive.clone(),
            (false, false) => format!("{}\n\n{}", self.system_directive, self.user_content),
        }
    }
}

/// How a moderation verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationMethod {
    /// Judge answered with the requested JSON shape
    Structured,
    /// Judge answered in prose; marker phrases were searched
    Heuristic,
    /// Judge call failed; the original passes through
    Indeterminate,
}

/// Accept/reject decision from the moderation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationVerdict {
    pub accepted: bool,
    pub substitute_content: Option<String>,
    pub method: ModerationMethod,
}

impl ModerationVerdict {
    pub fn accepted(method: ModerationMethod) -> Self {
        Self {
            accepted: true,
            substitute_content: None,
            method,
        }
    }

    pub fn rejected(substitute: impl Into<String>, method: ModerationMethod) -> Self {
        Self {
            accepted: false,
            substitute_content: Some(substitute.into()),
            method,
        }
    }

    /// Text to deliver: the substitute when rejected, else the original
    pub fn apply(self, original: String) -> String {
        match self.substitute_content {
            Some(substitute) if !self.accepted => substitute,
            _ => original,
        }
    }
}

/// Structured narrator turn, when the model answered in JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NarratorTurn {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl NarratorTurn {
    /// Parse the first JSON object found in `text`
    pub fn parse(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }
}

/// Generated media
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactContent {
    Text {
        text: String,
        turn: Option<NarratorTurn>,
    },
    Image {
        png: Vec<u8>,
        prompt: String,
    },
    Audio {
        bytes: Vec<u8>,
        mime: String,
    },
    Transcript {
        text: String,
    },
}

/// Successful result of one request
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub model_id: String,
    pub content: ArtifactContent,
    /// True when moderation replaced the model's own output
    pub substituted: bool,
}

impl Artifact {
    pub fn new(model_id: impl Into<String>, content: ArtifactContent) -> Self {
        Self {
            model_id: model_id.into(),
            content,
            substituted: false,
        }
    }

    pub fn with_substitution(mut self, substituted: bool) -> Self {
        self.substituted = substituted;
        self
    }

    pub fn kind(&self) -> ContentKind {
        match self.content {
            ArtifactContent::Text { .. } => ContentKind::Text,
            ArtifactContent::Image { .. } => ContentKind::Image,
            ArtifactContent::Audio { .. } => ContentKind::SpeechSynthesis,
            ArtifactContent::Transcript { .. } => ContentKind::SpeechRecognition,
        }
    }

    /// Text body of text and transcript artifacts
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ArtifactContent::Text { text, .. } | ArtifactContent::Transcript { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_capability_mapping() {
        assert_eq!(ContentKind::Text.capability(), Capability::Chat);
        assert_eq!(ContentKind::SpeechRecognition.capability(), Capability::SpeechToText);
        assert_eq!(ContentKind::SpeechSynthesis.to_string(), "speech_synthesis");
    }

    #[test]
    fn test_role_accepts_legacy_names() {
        let role: Role = serde_json::from_str("\"DM\"").unwrap();
        assert_eq!(role, Role::Narrator);
        let role: Role = serde_json::from_str("\"Player\"").unwrap();
        assert_eq!(role, Role::Character);
        assert_eq!(Role::Narrator.speaker(), "Dungeon Master");
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: GenerationRequest = serde_json::from_value(serde_json::json!({
            "content_kind": "text",
            "payload": {"type": "prompt", "text": "Open the door"}
        }))
        .unwrap();
        assert_eq!(request.role, Role::Narrator);
        assert!(!request.safety_mode);
        assert!(request.model_id.is_none());
    }

    #[test]
    fn test_blank_modifiers_are_unset() {
        let request = GenerationRequest::text(Payload::prompt("hi"))
            .with_language("  ")
            .with_style("cartoon");
        assert_eq!(request.language(), None);
        assert_eq!(request.style(), Some("cartoon"));
    }

    #[test]
    fn test_render_joins_directive_and_content() {
        assert_eq!(ComposedPrompt::new("sys", "user").render(), "sys\n\nuser");
        assert_eq!(ComposedPrompt::new("", "user").render(), "user");
        assert_eq!(ComposedPrompt::new("sys", "").render(), "sys");
    }

    #[test]
    fn test_verdict_apply() {
        let original = "orc attack".to_string();
        assert_eq!(
            ModerationVerdict::rejected("friendly orc", ModerationMethod::Heuristic).apply(original.clone()),
            "friendly orc"
        );
        assert_eq!(
            ModerationVerdict::accepted(ModerationMethod::Structured).apply(original.clone()),
            original
        );
    }

    #[test]
    fn test_narrator_turn_parsing() {
        let turn = NarratorTurn::parse(
            "```json\n{\"role\": \"Dungeon Master\", \"content\": \"A door creaks.\", \"options\": [\"Enter\", \"Flee\"]}\n```",
        )
        .unwrap();
        assert_eq!(turn.content, "A door creaks.");
        assert_eq!(turn.options.len(), 2);
        assert!(NarratorTurn::parse("just prose").is_none());
    }
}
