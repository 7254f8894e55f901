// OpenRouter chat completions (remote text models)

use super::{ChatParams, ChatProvider};
use crate::orchestration::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Chat adapter for any model routed through OpenRouter
#[derive(Clone)]
pub struct OpenRouterChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterChat {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            referer: "http://localhost:3000".to_string(),
            title: "AI Dungeon Master".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Attribution headers OpenRouter shows on its dashboards
    pub fn with_attribution(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.referer = referer.into();
        self.title = title.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenRouterChat {
    async fn complete(
        &self,
        backing: &str,
        system: &str,
        user: &str,
        params: &ChatParams,
    ) -> Result<String, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: user,
        });

        let request = ChatRequest {
            model: backing,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            response_format: params.json.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ProviderError::Malformed(format!("{} returned no choices", backing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    #[tokio::test]
    async fn test_complete_sends_model_messages_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("X-Title", "AI Dungeon Master"))
            .and(body_partial_json(serde_json::json!({
                "model": "openai/gpt-4o-mini",
                "max_tokens": 500,
                "messages": [
                    {"role": "system", "content": "be the DM"},
                    {"role": "user", "content": "I open the door"}
                ],
                "response_format": {"type": "json_object"}
            })))
            .respond_with(reply("  The door creaks open.\n"))
            .expect(1)
            .mount(&server)
            .await;

        let chat = OpenRouterChat::new("sk-test").with_base_url(server.uri());
        let text = chat
            .complete(
                "openai/gpt-4o-mini",
                "be the DM",
                "I open the door",
                &ChatParams::narrative(500).with_json(true),
            )
            .await
            .unwrap();
        assert_eq!(text, "The door creaks open.");
    }

    #[tokio::test]
    async fn test_empty_system_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(reply("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let chat = OpenRouterChat::new("k").with_base_url(server.uri());
        let text = chat
            .complete("google/gemini-pro", "", "hi", &ChatParams::moderation(500))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_rate_limit_and_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "busy"})))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "empty"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let chat = OpenRouterChat::new("k").with_base_url(server.uri());
        let params = ChatParams::narrative(500);
        assert!(matches!(
            chat.complete("busy", "", "hi", &params).await,
            Err(ProviderError::RateLimited(_))
        ));
        assert!(matches!(
            chat.complete("empty", "", "hi", &params).await,
            Err(ProviderError::Malformed(_))
        ));
    }
}
