// OpenAI-compatible image and audio endpoints
//
// `OpenAiAudio` is also pointed at a local OpenAI-compatible audio server,
// in which case no API key is sent.

use super::{ImageParams, ImageProvider, SpeechRecognizer, SpeechSynthesizer, Voice};
use crate::orchestration::error::ProviderError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Voices offered by the OpenAI speech endpoint
pub fn default_voices() -> Vec<Voice> {
    ["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
        .into_iter()
        .map(|id| {
            let mut name = id.to_string();
            name[..1].make_ascii_uppercase();
            Voice::new(id, name)
        })
        .collect()
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), body))
}

/// Image generation through `/images/generations`
#[derive(Clone)]
pub struct OpenAiImages {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    size: String,
}

impl OpenAiImages {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            size: "1024x1024".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Output size as the API spells it, e.g. `1024x1024`
    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
}

#[async_trait]
impl ImageProvider for OpenAiImages {
    // Hosted models pick their own sampler; only the prompt and size apply.
    async fn image(&self, backing: &str, prompt: &str, _params: &ImageParams) -> Result<Vec<u8>, ProviderError> {
        let request = ImageRequest {
            model: backing,
            prompt,
            n: 1,
            size: &self.size,
            response_format: "b64_json",
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let body: ImageResponse = check_status(response).await?.json().await?;

        let encoded = body
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| ProviderError::Malformed(format!("{} returned no image data", backing)))?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| ProviderError::Malformed(format!("Invalid base64 image: {}", e)))
    }
}

/// Speech synthesis and transcription through `/audio/*`
#[derive(Clone)]
pub struct OpenAiAudio {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    voices: Vec<Voice>,
}

impl OpenAiAudio {
    /// Hosted OpenAI audio
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: Some(api_key.into()),
            voices: default_voices(),
        }
    }

    /// A self-hosted server speaking the same API, without credentials
    pub fn local(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            voices: default_voices(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_voices(mut self, voices: Vec<Voice>) -> Self {
        if !voices.is_empty() {
            self.voices = voices;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, endpoint));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl SpeechSynthesizer for OpenAiAudio {
    // The speech endpoint infers language from the input text.
    async fn speak(
        &self,
        backing: &str,
        text: &str,
        voice: Option<&str>,
        _language: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError> {
        let voice = voice
            .or_else(|| self.voices.first().map(|v| v.id.as_str()))
            .unwrap_or("alloy");
        let request = SpeechRequest {
            model: backing,
            input: text,
            voice,
            response_format: "mp3",
        };

        let response = self.post("/audio/speech").json(&request).send().await?;
        let bytes = check_status(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::Malformed(format!("{} returned empty audio", backing)));
        }
        Ok(bytes.to_vec())
    }

    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }
}

#[async_trait]
impl SpeechRecognizer for OpenAiAudio {
    async fn transcribe(&self, backing: &str, audio: &[u8], language: Option<&str>) -> Result<String, ProviderError> {
        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.webm")
            .mime_str("audio/webm")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", backing.to_string());
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self.post("/audio/transcriptions").multipart(form).send().await?;
        let body: TranscriptionResponse = check_status(response).await?.json().await?;
        Ok(body.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_default_voices_are_capitalized() {
        let voices = default_voices();
        assert_eq!(voices.len(), 6);
        assert_eq!(voices[0], Voice::new("alloy", "Alloy"));
    }

    #[tokio::test]
    async fn test_image_decodes_base64_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(header("authorization", "Bearer sk-img"))
            .and(body_partial_json(serde_json::json!({
                "model": "dall-e-3",
                "prompt": "a misty harbor",
                "n": 1,
                "size": "1024x1024",
                "response_format": "b64_json"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"b64_json": BASE64.encode(b"\x89PNG image")}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let images = OpenAiImages::new("sk-img").with_base_url(server.uri());
        let png = images
            .image("dall-e-3", "a misty harbor", &ImageParams::default())
            .await
            .unwrap();
        assert_eq!(png, b"\x89PNG image");
    }

    #[tokio::test]
    async fn test_image_policy_rejection_is_invalid_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_string("content_policy_violation"))
            .mount(&server)
            .await;

        let images = OpenAiImages::new("k").with_base_url(server.uri());
        let err = images
            .image("dall-e-3", "x", &ImageParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(msg) if msg.contains("content_policy")));
    }

    #[tokio::test]
    async fn test_speak_returns_audio_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/speech"))
            .and(body_partial_json(serde_json::json!({
                "model": "tts-1",
                "input": "Welcome, traveller",
                "voice": "nova"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3audio".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let audio = OpenAiAudio::new("k").with_base_url(server.uri());
        let bytes = audio
            .speak("tts-1", "Welcome, traveller", Some("nova"), None)
            .await
            .unwrap();
        assert_eq!(bytes, b"ID3audio");
    }

    #[tokio::test]
    async fn test_transcribe_posts_multipart_to_local_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .and(body_string_contains("whisper-1"))
            .and(body_string_contains("audio.webm"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": " I search the chest. "
            })))
            .expect(1)
            .mount(&server)
            .await;

        let audio = OpenAiAudio::local(server.uri());
        let text = audio
            .transcribe("whisper-1", b"webm bytes", Some("en"))
            .await
            .unwrap();
        assert_eq!(text, "I search the chest.");
    }
}
