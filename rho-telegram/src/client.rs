//! Telegram Bot API client (§6).
//!
//! A thin `reqwest`-based wrapper exposing exactly the operations the
//! worker runtime needs. `getUpdates` deserializes straight into
//! `rho_bridge_core::envelope::RawUpdate` — the same JSON shape Telegram
//! sends on the wire — so there is no adapter layer translating one typed
//! API model into another between the client and C7's normalizer.

use async_trait::async_trait;
use rho_bridge_core::envelope::RawUpdate;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("telegram api error {status}: {description}")]
    Api {
        status: u16,
        description: String,
        retry_after_seconds: Option<u64>,
    },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("response was not understood: {0}")]
    Shape(String),
}

impl ClientError {
    /// The HTTP/Telegram status code, for callers applying the retry policy.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            ClientError::Api { retry_after_seconds, .. } => *retry_after_seconds,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseModeKind {
    Html,
    Plain,
}

#[derive(Debug, Clone, Copy)]
pub enum ChatActionKind {
    Typing,
    RecordVoice,
    UploadVoice,
}

impl ChatActionKind {
    fn as_str(self) -> &'static str {
        match self {
            ChatActionKind::Typing => "typing",
            ChatActionKind::RecordVoice => "record_voice",
            ChatActionKind::UploadVoice => "upload_voice",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Everything the worker runtime needs from a Telegram client. Split out as
/// a trait so the worker's polling/draining logic can be exercised against
/// a fake client in tests without a network.
#[async_trait]
pub trait TelegramClient: Send + Sync {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<RawUpdate>, ClientError>;

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseModeKind>,
        message_thread_id: Option<i64>,
        reply_to_message_id: Option<i64>,
    ) -> Result<(), ClientError>;

    async fn send_chat_action(
        &self,
        chat_id: i64,
        action: ChatActionKind,
        message_thread_id: Option<i64>,
    ) -> Result<(), ClientError>;

    async fn send_voice(
        &self,
        chat_id: i64,
        message_thread_id: Option<i64>,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<(), ClientError>;

    async fn get_file_path(&self, file_id: &str) -> Result<String, ClientError>;

    async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, ClientError>;

    async fn get_me_username(&self) -> Result<String, ClientError>;
}

pub struct HttpTelegramClient {
    client: reqwest::Client,
    token: String,
}

impl HttpTelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("https://api.telegram.org/file/bot{}/{}", self.token, file_path)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ClientError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.unwrap_envelope(response).await
    }

    async fn unwrap_envelope(&self, response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status().as_u16();
        let payload: Value = response.json().await.map_err(|e| ClientError::Shape(e.to_string()))?;
        let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !ok {
            let description = payload.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let retry_after_seconds = payload
                .get("parameters")
                .and_then(|p| serde_json::from_value::<ResponseParameters>(p.clone()).ok())
                .and_then(|p| p.retry_after);
            return Err(ClientError::Api {
                status,
                description,
                retry_after_seconds,
            });
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TelegramClient for HttpTelegramClient {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<RawUpdate>, ClientError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "edited_message"],
        });
        let result = self.call("getUpdates", body).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Shape(e.to_string()))
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseModeKind>,
        message_thread_id: Option<i64>,
        reply_to_message_id: Option<i64>,
    ) -> Result<(), ClientError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "link_preview_options": {"is_disabled": true},
        });
        if parse_mode == Some(ParseModeKind::Html) {
            body["parse_mode"] = json!("HTML");
        }
        if let Some(thread_id) = message_thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        if let Some(reply_id) = reply_to_message_id {
            body["reply_parameters"] = json!({"message_id": reply_id});
        }
        self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn send_chat_action(
        &self,
        chat_id: i64,
        action: ChatActionKind,
        message_thread_id: Option<i64>,
    ) -> Result<(), ClientError> {
        let mut body = json!({
            "chat_id": chat_id,
            "action": action.as_str(),
        });
        if let Some(thread_id) = message_thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        self.call("sendChatAction", body).await?;
        Ok(())
    }

    async fn send_voice(
        &self,
        chat_id: i64,
        message_thread_id: Option<i64>,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<(), ClientError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let mut form = reqwest::multipart::Form::new().text("chat_id", chat_id.to_string()).part("voice", part);
        if let Some(thread_id) = message_thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }

        let response = self
            .client
            .post(self.api_url("sendVoice"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.unwrap_envelope(response).await?;
        Ok(())
    }

    async fn get_file_path(&self, file_id: &str) -> Result<String, ClientError> {
        let result = self.call("getFile", json!({ "file_id": file_id })).await?;
        result
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Shape("missing file_path".to_string()))
    }

    async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Api {
                status: response.status().as_u16(),
                description: "file download failed".to_string(),
                retry_after_seconds: None,
            });
        }
        response.bytes().await.map(|b| b.to_vec()).map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn get_me_username(&self) -> Result<String, ClientError> {
        let result = self.call("getMe", json!({})).await?;
        result
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Shape("missing username".to_string()))
    }
}
