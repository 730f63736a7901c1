//! Queue store (C5): crash-safe load/save of the inbound and outbound
//! arrays. Jobs have their own status machine and live in [`crate::jobs`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::atomic_io;
use crate::envelope::Envelope;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingInbound {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "sessionFile")]
    pub session_file: String,
}

pub const MAX_OUTBOUND_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOutbound {
    #[serde(rename = "chatId")]
    pub chat_id: i64,
    #[serde(rename = "replyToMessageId", default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(rename = "messageThreadId", default)]
    pub message_thread_id: Option<i64>,
    pub text: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(rename = "notBeforeMs", default)]
    pub not_before_ms: i64,
}

impl PendingOutbound {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            reply_to_message_id: None,
            message_thread_id: None,
            text: text.into(),
            attempts: 0,
            not_before_ms: 0,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.attempts < MAX_OUTBOUND_ATTEMPTS
    }
}

/// Load a queue array from `path`, returning `[]` on any parse error or a
/// non-array root, then filtering out elements that fail `is_valid`.
pub fn load_validated<T>(path: &Path, is_valid: impl Fn(&T) -> bool) -> Vec<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: Vec<serde_json::Value> = atomic_io::load_json_or_default(path, Vec::new());
    raw.into_iter()
        .filter_map(|v| serde_json::from_value::<T>(v).ok())
        .filter(is_valid)
        .collect()
}

/// Persist a queue array to `path`, replacing the whole file via C1.
pub fn save<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(items)?)
}

pub fn is_valid_inbound(item: &PendingInbound) -> bool {
    !item.session_file.is_empty()
        && (!item.envelope.text.is_empty() || item.envelope.media.is_some())
}

pub fn is_valid_outbound(item: &PendingOutbound) -> bool {
    !item.text.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::session_map::ChatType;
    use tempfile::tempdir;

    fn envelope() -> Envelope {
        Envelope {
            update_id: 1,
            chat_id: 100,
            chat_type: ChatType::Private,
            user_id: Some(1),
            message_id: 1,
            date: 0,
            text: "hi".into(),
            media: None,
            reply_to_message_id: None,
            is_reply_to_bot: false,
            message_thread_id: None,
        }
    }

    #[test]
    fn load_validated_drops_non_array_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inbound.queue.json");
        atomic_io::write_text(&path, r#"{"not":"an array"}"#).unwrap();
        let items: Vec<PendingInbound> = load_validated(&path, is_valid_inbound);
        assert!(items.is_empty());
    }

    #[test]
    fn load_validated_drops_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inbound.queue.json");
        atomic_io::write_text(&path, "not json at all").unwrap();
        let items: Vec<PendingInbound> = load_validated(&path, is_valid_inbound);
        assert!(items.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inbound.queue.json");
        let item = PendingInbound {
            envelope: envelope(),
            session_key: "dm:100".into(),
            session_file: "/tmp/session.jsonl".into(),
        };
        save(&path, &[item.clone()]).unwrap();

        let loaded: Vec<PendingInbound> = load_validated(&path, is_valid_inbound);
        assert_eq!(loaded, vec![item]);
    }

    #[test]
    fn outbound_attempts_cap() {
        let mut item = PendingOutbound::new(1, "hello");
        assert!(item.is_retriable());
        item.attempts = MAX_OUTBOUND_ATTEMPTS;
        assert!(!item.is_retriable());
    }

    #[test]
    fn is_valid_outbound_rejects_empty_text() {
        let item = PendingOutbound::new(1, "");
        assert!(!is_valid_outbound(&item));
    }
}
