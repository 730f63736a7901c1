//! STT provider contract: `transcribe(bytes, mime_type, file_name) → text`.
//!
//! Out of scope per §1: "STT HTTP clients beyond their contract". This
//! module defines the trait and one concrete ElevenLabs-backed
//! implementation so the worker has something real to construct; other
//! providers (OpenAI) plug in behind the same trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("missing or invalid API key")]
    ApiKey,
    #[error("transcription request failed: {0}")]
    Request(String),
    #[error("transcription response was not understood: {0}")]
    Response(String),
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(&self, bytes: &[u8], mime_type: &str, file_name: &str) -> Result<String, SttError>;
}

/// ElevenLabs speech-to-text client.
pub struct ElevenLabsStt {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ElevenLabsStt {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl SttProvider for ElevenLabsStt {
    async fn transcribe(&self, bytes: &[u8], mime_type: &str, file_name: &str) -> Result<String, SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::ApiKey);
        }

        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| SttError::Request(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model_id", self.model.clone());

        let response = self
            .client
            .post("https://api.elevenlabs.io/v1/speech-to-text")
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SttError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SttError::ApiKey);
        }
        if !response.status().is_success() {
            return Err(SttError::Request(format!("status {}", response.status())));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SttError::Response(e.to_string()))?;
        payload
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| SttError::Response("missing 'text' field".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcribe_rejects_empty_api_key() {
        let stt = ElevenLabsStt::new("", "scribe_v1");
        let result = stt.transcribe(b"fake-audio", "audio/ogg", "voice.ogg").await;
        assert!(matches!(result, Err(SttError::ApiKey)));
    }
}
