// Prompt composer - folds the request's behavioral modifiers into a
// system directive plus user content. Pure: same request and descriptor,
// same prompt.

use super::registry::ProviderDescriptor;
use super::types::{ComposedPrompt, ContentKind, GenerationRequest, Payload, Role};

const BASE_DIRECTIVE: &str = "You are an adaptive RPG AI capable of playing both as a Dungeon Master and as a Player character. \
Respond appropriately based on the role specified in the prompt. \
Keep your responses concise and relevant to the game context.";

const NARRATOR_STRUCTURED: &str = " Respond in JSON format, with the following keys: 'role', 'content', 'options' (for multiple choice questions or actions). \
e.g. { 'role': 'Dungeon Master', 'content': 'Story content', 'options': ['Option 1', 'Option 2', ...] }.";

const NARRATOR_PLAIN: &str = " You are the Dungeon Master. Narrate what happens next in plain prose, \
then end your turn by listing the choices the players have.";

const CHARACTER: &str = " You are a Player character. Answer in the first person with what your character says and does.";

const SAFETY_BLOCK: &str = " As this is a game for children, ensure all content is family-friendly and appropriate for young audiences. \
Avoid any scary, violent, or adult themes. Focus on positive, educational, and fun experiences. \
Use simple language and explain any complex concepts. Encourage teamwork, problem-solving, and creativity. \
Make sure all characters and situations are suitable for children. \
Keep the game light-hearted and engaging, with a focus on exploration and discovery. \
Use positive reinforcement and encouragement to motivate players. \
Use short sentences and simple words to make the game easy to understand. \
Encourage players to use their imagination and creativity to solve problems. \
Use icons when it makes sense to help players understand the game.";

const IMAGE_BASE: &str = "You write prompts for an image generator. Describe a single illustration of the scene below: \
the setting, the characters present and what they are doing, the lighting and the mood. \
Use one short paragraph of concrete visual details and no dialogue.";

const IMAGE_SAFETY_BLOCK: &str = " The illustration is for children: keep it friendly and bright, \
with no blood, weapons in use, frightening creatures or adult content.";

/// Negatives sent with every local diffusion request
pub const QUALITY_NEGATIVES: &str = "bad quality, worse quality, blurry, deformed, watermark, text";

/// Extra negatives when the audience is children
pub const SAFETY_NEGATIVES: &str = "gore, blood, violence, nudity, horror, scary";

/// Builds provider prompts from requests
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptComposer;

impl PromptComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(&self, request: &GenerationRequest, descriptor: &ProviderDescriptor) -> ComposedPrompt {
        let kind = request.content_kind;
        let mut directive = match kind {
            ContentKind::Text => BASE_DIRECTIVE.to_string(),
            ContentKind::Image => IMAGE_BASE.to_string(),
            ContentKind::SpeechSynthesis | ContentKind::SpeechRecognition => String::new(),
        };

        if kind == ContentKind::Text {
            directive.push_str(match request.role {
                Role::Narrator if descriptor.structured_output => NARRATOR_STRUCTURED,
                Role::Narrator => NARRATOR_PLAIN,
                Role::Character => CHARACTER,
            });
        }

        if request.safety_mode {
            match kind {
                ContentKind::Text => directive.push_str(SAFETY_BLOCK),
                ContentKind::Image => directive.push_str(IMAGE_SAFETY_BLOCK),
                _ => {}
            }
        }

        if let Some(language) = request.language() {
            directive.push_str(&format!("\nRespond in language ({}).", language));
        }

        if kind == ContentKind::Image {
            if let Some(style) = request.style() {
                directive.push_str(&format!(" Render the scene in a {} style.", style));
            }
            if let Some(theme) = request.theme() {
                directive.push_str(&format!(
                    " Keep the imagery consistent with the {} theme of the adventure.",
                    theme
                ));
            }
        }

        let directive = directive.trim_start().to_string();
        ComposedPrompt::new(directive, user_content(request))
    }

    /// Negative prompt for local diffusion
    pub fn negative_prompt(&self, request: &GenerationRequest) -> String {
        if request.safety_mode {
            format!("{}, {}", QUALITY_NEGATIVES, SAFETY_NEGATIVES)
        } else {
            QUALITY_NEGATIVES.to_string()
        }
    }
}

fn user_content(request: &GenerationRequest) -> String {
    match (&request.payload, request.content_kind) {
        (Payload::Prompt { text }, _) => text.trim().to_string(),
        (Payload::Scene { context, action }, ContentKind::Image) => {
            let context = context.trim();
            if context.is_empty() {
                format!("Illustrate this moment: {}", action.trim())
            } else {
                format!("Story so far:\n{}\n\nIllustrate this moment: {}", context, action.trim())
            }
        }
        (Payload::Scene { context, action }, _) => {
            let context = context.trim();
            let mut content = String::new();
            if !context.is_empty() {
                content.push_str(context);
                content.push('\n');
            }
            content.push_str(action.trim());
            content.push_str(&format!("\n\nAs the {}, respond to this:", request.role.speaker()));
            content
        }
        (Payload::Audio { .. }, _) => String::new(),
    }
}
