//! Update normalization and authorization (C7).
//!
//! The raw Telegram update shape is modeled directly as serde types so this
//! module stays testable without any HTTP client or bot library in scope —
//! per the design note reducing the source's two interchangeable Telegram
//! clients to one abstract interface, the bridge client (in `rho-telegram`)
//! is responsible for handing this module plain update JSON.

use serde::{Deserialize, Serialize};

use crate::session_map::ChatType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Voice,
    Audio,
    DocumentAudio,
    Photo,
    DocumentImage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub kind: MediaKind,
    #[serde(rename = "fileId")]
    pub file_id: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,
    #[serde(rename = "durationSeconds", default)]
    pub duration_seconds: Option<u32>,
    #[serde(rename = "fileSize", default)]
    pub file_size: Option<u64>,
}

impl Media {
    pub fn is_audio(&self) -> bool {
        matches!(
            self.kind,
            MediaKind::Voice | MediaKind::Audio | MediaKind::DocumentAudio
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, MediaKind::Photo | MediaKind::DocumentImage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "updateId")]
    pub update_id: i64,
    #[serde(rename = "chatId")]
    pub chat_id: i64,
    #[serde(rename = "chatType")]
    pub chat_type: ChatType,
    #[serde(rename = "userId")]
    pub user_id: Option<i64>,
    #[serde(rename = "messageId")]
    pub message_id: i64,
    pub date: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(rename = "replyToMessageId", default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(rename = "isReplyToBot", default)]
    pub is_reply_to_bot: bool,
    #[serde(rename = "messageThreadId", default)]
    pub message_thread_id: Option<i64>,
}

// ---- Raw Telegram update shape (input to `normalize`) ----

#[derive(Debug, Clone, Deserialize)]
pub struct RawUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub edited_message: Option<RawMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: RawChat,
    #[serde(default)]
    pub from: Option<RawUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub voice: Option<RawVoice>,
    #[serde(default)]
    pub audio: Option<RawAudio>,
    #[serde(default)]
    pub document: Option<RawDocument>,
    #[serde(default)]
    pub photo: Option<Vec<RawPhotoSize>>,
    #[serde(default)]
    pub reply_to_message: Option<Box<RawMessage>>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVoice {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAudio {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
}

const FIVE_MIB: u64 = 5 * 1024 * 1024;

/// Normalize a raw update into an [`Envelope`], preferring `message` over
/// `edited_message`, and only if the chosen message carries usable content
/// (non-empty text or recognizable media). `threaded_mode=false` strips
/// `message_thread_id`.
pub fn normalize(update: &RawUpdate, threaded_mode: bool) -> Option<Envelope> {
    let msg = update
        .message
        .as_ref()
        .or(update.edited_message.as_ref())?;

    let media = media_from_message(msg);
    let text = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();

    if text.is_empty() && media.is_none() {
        return None;
    }

    let chat_type = match msg.chat.kind.as_str() {
        "private" => ChatType::Private,
        "group" => ChatType::Group,
        "supergroup" => ChatType::Supergroup,
        "channel" => ChatType::Channel,
        _ => return None,
    };

    let is_reply_to_bot = msg
        .reply_to_message
        .as_ref()
        .and_then(|r| r.from.as_ref())
        .map(|u| u.is_bot)
        .unwrap_or(false);

    Some(Envelope {
        update_id: update.update_id,
        chat_id: msg.chat.id,
        chat_type,
        user_id: msg.from.as_ref().map(|u| u.id),
        message_id: msg.message_id,
        date: msg.date,
        text,
        media,
        reply_to_message_id: msg.reply_to_message.as_ref().map(|r| r.message_id),
        is_reply_to_bot,
        message_thread_id: if threaded_mode {
            msg.message_thread_id
        } else {
            None
        },
    })
}

/// Choose the photo variant per §3: the largest whose `fileSize < 5 MiB`;
/// else the medium entry if all sizes are unknown; else `None`.
fn choose_photo(sizes: &[RawPhotoSize]) -> Option<&RawPhotoSize> {
    if sizes.is_empty() {
        return None;
    }
    let known_sizes: Vec<&RawPhotoSize> = sizes.iter().filter(|s| s.file_size.is_some()).collect();
    if known_sizes.is_empty() {
        return sizes.get(sizes.len() / 2);
    }
    known_sizes
        .into_iter()
        .filter(|s| s.file_size.unwrap() < FIVE_MIB)
        .max_by_key(|s| s.file_size.unwrap())
}

fn media_from_message(msg: &RawMessage) -> Option<Media> {
    if let Some(voice) = &msg.voice {
        return Some(Media {
            kind: MediaKind::Voice,
            file_id: voice.file_id.clone(),
            mime_type: voice.mime_type.clone(),
            file_name: None,
            duration_seconds: voice.duration,
            file_size: voice.file_size,
        });
    }
    if let Some(audio) = &msg.audio {
        return Some(Media {
            kind: MediaKind::Audio,
            file_id: audio.file_id.clone(),
            mime_type: audio.mime_type.clone(),
            file_name: audio.file_name.clone(),
            duration_seconds: audio.duration,
            file_size: audio.file_size,
        });
    }
    if let Some(doc) = &msg.document {
        let mime = doc.mime_type.as_deref().unwrap_or("");
        if mime.starts_with("audio/") {
            return Some(Media {
                kind: MediaKind::DocumentAudio,
                file_id: doc.file_id.clone(),
                mime_type: doc.mime_type.clone(),
                file_name: doc.file_name.clone(),
                duration_seconds: None,
                file_size: doc.file_size,
            });
        }
        if mime.starts_with("image/") {
            return Some(Media {
                kind: MediaKind::DocumentImage,
                file_id: doc.file_id.clone(),
                mime_type: doc.mime_type.clone(),
                file_name: doc.file_name.clone(),
                duration_seconds: None,
                file_size: doc.file_size,
            });
        }
    }
    if let Some(sizes) = &msg.photo {
        if let Some(chosen) = choose_photo(sizes) {
            return Some(Media {
                kind: MediaKind::Photo,
                file_id: chosen.file_id.clone(),
                mime_type: Some("image/jpeg".to_string()),
                file_name: None,
                duration_seconds: None,
                file_size: chosen.file_size,
            });
        }
    }
    None
}

/// Authorization outcome per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Ok,
    ChatNotAllowed,
    UserNotAllowed,
    GroupNotActivated,
}

pub struct AuthSettings<'a> {
    pub allowed_chat_ids: &'a [i64],
    pub allowed_user_ids: &'a [i64],
    pub strict_allowlist: bool,
    pub require_mention_in_groups: bool,
}

/// Authorize an envelope against settings.
pub fn authorize(envelope: &Envelope, settings: &AuthSettings, bot_username: &str) -> AuthDecision {
    if !is_allowed(envelope.chat_id, settings.allowed_chat_ids, settings.strict_allowlist) {
        return AuthDecision::ChatNotAllowed;
    }

    if let Some(user_id) = envelope.user_id {
        if !is_allowed(user_id, settings.allowed_user_ids, settings.strict_allowlist) {
            return AuthDecision::UserNotAllowed;
        }
    } else if settings.strict_allowlist {
        return AuthDecision::UserNotAllowed;
    }

    let is_group = !matches!(envelope.chat_type, ChatType::Private);
    if is_group && settings.require_mention_in_groups {
        let mentioned = envelope.is_reply_to_bot
            || envelope.text.trim_start().starts_with("/rho")
            || mentions_username(&envelope.text, bot_username);
        if !mentioned {
            return AuthDecision::GroupNotActivated;
        }
    }

    AuthDecision::Ok
}

fn is_allowed(id: i64, allowlist: &[i64], strict: bool) -> bool {
    if allowlist.is_empty() {
        return !strict;
    }
    allowlist.contains(&id)
}

fn mentions_username(text: &str, bot_username: &str) -> bool {
    if bot_username.is_empty() {
        return false;
    }
    let needle = format!("@{}", bot_username.to_lowercase());
    text.to_lowercase().contains(&needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> RawUpdate {
        serde_json::from_str(
            r#"{
                "update_id": 7,
                "message": {
                    "message_id": 42,
                    "date": 1700000000,
                    "chat": {"id": 100, "type": "private"},
                    "from": {"id": 1},
                    "text": "hi"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn normalize_basic_echo_scenario() {
        let update = sample_update();
        let envelope = normalize(&update, true).unwrap();
        assert_eq!(envelope.update_id, 7);
        assert_eq!(envelope.chat_id, 100);
        assert_eq!(envelope.chat_type, ChatType::Private);
        assert_eq!(envelope.user_id, Some(1));
        assert_eq!(envelope.text, "hi");
        assert!(envelope.media.is_none());
    }

    #[test]
    fn normalize_rejects_update_with_no_usable_content() {
        let update: RawUpdate = serde_json::from_str(
            r#"{"update_id": 1, "message": {"message_id": 1, "date": 1, "chat": {"id": 1, "type": "private"}}}"#,
        )
        .unwrap();
        assert!(normalize(&update, true).is_none());
    }

    #[test]
    fn normalize_strips_thread_id_when_not_threaded() {
        let update: RawUpdate = serde_json::from_str(
            r#"{"update_id": 1, "message": {"message_id": 1, "date": 1, "chat": {"id": 1, "type": "supergroup"}, "text": "x", "message_thread_id": 9}}"#,
        )
        .unwrap();
        let envelope = normalize(&update, false).unwrap();
        assert_eq!(envelope.message_thread_id, None);

        let envelope = normalize(&update, true).unwrap();
        assert_eq!(envelope.message_thread_id, Some(9));
    }

    #[test]
    fn choose_photo_picks_largest_under_5mib() {
        let sizes = vec![
            RawPhotoSize { file_id: "S".into(), file_size: Some(100) },
            RawPhotoSize { file_id: "M".into(), file_size: Some(500_000) },
            RawPhotoSize { file_id: "L".into(), file_size: Some(6_000_000) },
        ];
        let chosen = choose_photo(&sizes).unwrap();
        assert_eq!(chosen.file_id, "M");
    }

    #[test]
    fn choose_photo_boundary_4_999_mib_accepted() {
        let sizes = vec![RawPhotoSize {
            file_id: "X".into(),
            file_size: Some(FIVE_MIB - 1),
        }];
        assert!(choose_photo(&sizes).is_some());
    }

    #[test]
    fn choose_photo_boundary_5_mib_rejected() {
        let sizes = vec![RawPhotoSize {
            file_id: "X".into(),
            file_size: Some(FIVE_MIB),
        }];
        assert!(choose_photo(&sizes).is_none());
    }

    #[test]
    fn choose_photo_falls_back_to_medium_when_all_unknown() {
        let sizes = vec![
            RawPhotoSize { file_id: "a".into(), file_size: None },
            RawPhotoSize { file_id: "b".into(), file_size: None },
            RawPhotoSize { file_id: "c".into(), file_size: None },
        ];
        let chosen = choose_photo(&sizes).unwrap();
        assert_eq!(chosen.file_id, "b");
    }

    #[test]
    fn authorize_strict_empty_allowlist_denies_all() {
        let envelope = normalize(&sample_update(), true).unwrap();
        let settings = AuthSettings {
            allowed_chat_ids: &[],
            allowed_user_ids: &[],
            strict_allowlist: true,
            require_mention_in_groups: true,
        };
        assert_eq!(authorize(&envelope, &settings, "bot"), AuthDecision::ChatNotAllowed);
    }

    #[test]
    fn authorize_ok_when_allowlisted() {
        let envelope = normalize(&sample_update(), true).unwrap();
        let settings = AuthSettings {
            allowed_chat_ids: &[100],
            allowed_user_ids: &[1],
            strict_allowlist: true,
            require_mention_in_groups: true,
        };
        assert_eq!(authorize(&envelope, &settings, "bot"), AuthDecision::Ok);
    }

    #[test]
    fn authorize_group_requires_mention() {
        let update: RawUpdate = serde_json::from_str(
            r#"{"update_id": 1, "message": {"message_id": 1, "date": 1, "chat": {"id": 5, "type": "group"}, "from": {"id": 1}, "text": "hello there"}}"#,
        )
        .unwrap();
        let envelope = normalize(&update, true).unwrap();
        let settings = AuthSettings {
            allowed_chat_ids: &[5],
            allowed_user_ids: &[1],
            strict_allowlist: true,
            require_mention_in_groups: true,
        };
        assert_eq!(
            authorize(&envelope, &settings, "mybot"),
            AuthDecision::GroupNotActivated
        );
    }

    #[test]
    fn authorize_group_activated_via_mention() {
        let update: RawUpdate = serde_json::from_str(
            r#"{"update_id": 1, "message": {"message_id": 1, "date": 1, "chat": {"id": 5, "type": "group"}, "from": {"id": 1}, "text": "hi @MyBot"}}"#,
        )
        .unwrap();
        let envelope = normalize(&update, true).unwrap();
        let settings = AuthSettings {
            allowed_chat_ids: &[5],
            allowed_user_ids: &[1],
            strict_allowlist: true,
            require_mention_in_groups: true,
        };
        assert_eq!(authorize(&envelope, &settings, "mybot"), AuthDecision::Ok);
    }
}
