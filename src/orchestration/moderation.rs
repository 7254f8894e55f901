// Moderation gate - second-pass audience check over generated content
//
// Best effort only: a judge model is asked whether the text suits children
// and may supply a rewrite. It is not a compliance control, and it never
// fails the request.

use super::providers::{ChatParams, ChatProvider};
use super::types::{ModerationMethod, ModerationVerdict};
use serde::Deserialize;

const JUDGE_SYSTEM: &str = "You are a content moderator for children's content. Evaluate the following text and determine if it's suitable for children. If it's not suitable, provide a modified, child-friendly version.";

const JUDGE_SYSTEM_IMAGE: &str = "You are a content moderator for children's content. Evaluate the following image description and determine if an illustration of it would be suitable for children. If it's not suitable, provide a modified, child-friendly description.";

const STRUCTURED_FORMAT: &str = " Answer only with a JSON object of the form {\"suitable\": true|false, \"revised\": \"child-friendly version, or null when suitable\"}.";

const REJECT_MARKER: &str = "not suitable";
const REVISION_MARKER: &str = "Modified version:";

/// What is being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationDomain {
    Text,
    ImagePrompt,
}

#[derive(Debug, Deserialize)]
struct StructuredJudgement {
    suitable: bool,
    #[serde(default)]
    revised: Option<String>,
}

/// Judge call bound to one chat provider and model
pub struct ModerationGate<'a> {
    judge: &'a dyn ChatProvider,
    backing: &'a str,
    structured: bool,
    max_tokens: u32,
}

impl<'a> ModerationGate<'a> {
    pub fn new(judge: &'a dyn ChatProvider, backing: &'a str, structured: bool) -> Self {
        Self {
            judge,
            backing,
            structured,
            max_tokens: 500,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Judge `text`; failures of the judge pass the original through
    pub async fn moderate(&self, text: &str, domain: ModerationDomain) -> ModerationVerdict {
        let (system, user) = judge_prompt(text, domain, self.structured);
        let params = ChatParams::moderation(self.max_tokens).with_json(self.structured);

        match self.judge.complete(self.backing, &system, &user, &params).await {
            Ok(reply) => {
                let verdict = interpret(&reply, self.structured);
                if !verdict.accepted {
                    tracing::info!("Moderation replaced {:?} output from {}", domain, self.backing);
                }
                verdict
            }
            Err(e) => {
                tracing::warn!("Moderation judge {} failed, passing content through: {}", self.backing, e);
                ModerationVerdict::accepted(ModerationMethod::Indeterminate)
            }
        }
    }
}

/// System and user messages sent to the judge
pub fn judge_prompt(text: &str, domain: ModerationDomain, structured: bool) -> (String, String) {
    let mut system = match domain {
        ModerationDomain::Text => JUDGE_SYSTEM,
        ModerationDomain::ImagePrompt => JUDGE_SYSTEM_IMAGE,
    }
    .to_string();
    if structured {
        system.push_str(STRUCTURED_FORMAT);
    }
    let user = format!(
        "Text: {}\n\nIs this text suitable for children? If not, provide a modified version:",
        text
    );
    (system, user)
}

/// Turn the judge's reply into a verdict
pub fn interpret(reply: &str, structured: bool) -> ModerationVerdict {
    if structured {
        if let Some(verdict) = parse_structured(reply) {
            return verdict;
        }
        tracing::debug!("Structured moderation reply did not parse, reading it as prose");
    }
    parse_heuristic(reply)
}

fn parse_structured(reply: &str) -> Option<ModerationVerdict> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let judgement: StructuredJudgement = serde_json::from_str(&reply[start..=end]).ok()?;
    if judgement.suitable {
        return Some(ModerationVerdict::accepted(ModerationMethod::Structured));
    }
    match judgement.revised.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) {
        Some(revised) => Some(ModerationVerdict::rejected(revised, ModerationMethod::Structured)),
        None => {
            tracing::warn!("Judge flagged content without a revision; keeping the original");
            Some(ModerationVerdict::accepted(ModerationMethod::Structured))
        }
    }
}

fn parse_heuristic(reply: &str) -> ModerationVerdict {
    if !reply.to_lowercase().contains(REJECT_MARKER) {
        return ModerationVerdict::accepted(ModerationMethod::Heuristic);
    }
    match reply.rsplit_once(REVISION_MARKER).map(|(_, revised)| revised.trim()) {
        Some(revised) if !revised.is_empty() => ModerationVerdict::rejected(revised, ModerationMethod::Heuristic),
        _ => {
            tracing::warn!("Judge flagged content without a revision; keeping the original");
            ModerationVerdict::accepted(ModerationMethod::Heuristic)
        }
    }
}
