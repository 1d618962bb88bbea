use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::LlmError;
use crate::types::PromptMessage;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Raw audio as delivered by the transport.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn generate_reply(
        &self,
        system_prompt: &str,
        messages: &[PromptMessage],
    ) -> Result<String, LlmError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    chat_model: String,
    transcribe_model: String,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        chat_model: impl Into<String>,
        transcribe_model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            chat_model: chat_model.into(),
            transcribe_model: transcribe_model.into(),
        }
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        Ok(key)
    }
}

fn audio_file_name(mime_type: &str) -> &'static str {
    let mime = mime_type.to_ascii_lowercase();
    if mime.contains("ogg") || mime.contains("opus") {
        "audio.ogg"
    } else if mime.contains("mpeg") || mime.contains("mp3") {
        "audio.mp3"
    } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        "audio.m4a"
    } else if mime.contains("wav") {
        "audio.wav"
    } else {
        "audio.webm"
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn generate_reply(
        &self,
        system_prompt: &str,
        messages: &[PromptMessage],
    ) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let mut payload_messages = vec![json!({ "role": "system", "content": system_prompt })];
        payload_messages.extend(messages.iter().map(|message| {
            json!({ "role": message.role.as_str(), "content": message.content })
        }));

        let response = self
            .http
            .post(format!("{OPENAI_BASE_URL}/chat/completions"))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.chat_model,
                "messages": payload_messages,
                "temperature": 0.7,
                "max_tokens": 1200
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(LlmError::EmptyContent);
        }
        debug!(chars = text.len(), "model reply received");
        Ok(text)
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let file = Part::bytes(audio.bytes.clone())
            .file_name(audio_file_name(&audio.mime_type))
            .mime_str(&audio.mime_type)?;
        let form = Form::new()
            .text("model", self.transcribe_model.clone())
            .text("language", "pt")
            .part("file", file);

        let response = self
            .http
            .post(format!("{OPENAI_BASE_URL}/audio/transcriptions"))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(LlmError::EmptyContent);
        }
        Ok(text)
    }
}
