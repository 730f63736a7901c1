//! TTS provider contract: `synthesize(text) → MP3 bytes` (§6).
//!
//! Mirrors `stt.rs`'s trait-plus-one-implementation shape so other
//! providers can plug in behind `TtsProvider` the same way.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("missing or invalid API key")]
    ApiKey,
    #[error("speech synthesis request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError>;
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    output_format: &'a str,
}

pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
}

impl ElevenLabsTts {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
        }
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    /// Synthesize `text` to MP3 bytes via ElevenLabs.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        if self.api_key.is_empty() {
            return Err(TtsError::ApiKey);
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", self.voice_id);
        let body = TtsRequest {
            text,
            model_id: "eleven_multilingual_v2",
            output_format: "mp3_44100_128",
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TtsError::ApiKey);
        }
        if !response.status().is_success() {
            return Err(TtsError::Request(format!("status {}", response.status())));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TtsError::Request(e.to_string()))
    }
}
