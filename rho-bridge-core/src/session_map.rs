//! Session map (C6): chat-key → agent session-file mapping.
//!
//! Session files are JSONL transcripts living under the agent's own session
//! root (`~/.pi/agent/sessions/<safeCwd>/<ts>_<uuid>.jsonl`); this module
//! only owns the mapping from a chat key to a path, and the lazy creation
//! of a fresh session file (with its JSONL header) the first time a chat
//! needs one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic_io;
use crate::envelope::Envelope;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMap(HashMap<String, String>);

pub struct ResolveOutcome {
    pub session_key: String,
    pub session_file: PathBuf,
    pub created: bool,
}

/// Compute the session key for an envelope per §3: `dm:<chatId>` for
/// private chats, `group:<chatId>` otherwise, suffixed with
/// `:topic:<threadId>` when a thread id is present.
pub fn session_key(envelope: &Envelope) -> String {
    let base = if matches!(envelope.chat_type, ChatType::Private) {
        format!("dm:{}", envelope.chat_id)
    } else {
        format!("group:{}", envelope.chat_id)
    };
    match envelope.message_thread_id {
        Some(thread_id) => format!("{base}:topic:{thread_id}"),
        None => base,
    }
}

pub fn load(path: &Path) -> SessionMap {
    atomic_io::load_json_or_default(path, SessionMap::default())
}

impl SessionMap {
    /// Look up the session file currently mapped to `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

pub fn save(path: &Path, map: &SessionMap) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(map)?)
}

/// Resolve (creating if necessary) the session file for `envelope`.
///
/// If the key is already mapped and that file still exists on disk, it is
/// reused. Otherwise a fresh session file is created under `sessions_root`
/// and the map is updated in place.
pub fn resolve_session_file(
    map: &mut SessionMap,
    envelope: &Envelope,
    sessions_root: &Path,
    cwd: &str,
) -> Result<ResolveOutcome> {
    let key = session_key(envelope);

    if let Some(existing) = map.0.get(&key) {
        let existing_path = PathBuf::from(existing);
        if existing_path.exists() {
            return Ok(ResolveOutcome {
                session_key: key,
                session_file: existing_path,
                created: false,
            });
        }
    }

    let session_file = create_session_file(sessions_root, cwd)?;
    map.0.insert(key.clone(), session_file.to_string_lossy().into_owned());

    Ok(ResolveOutcome {
        session_key: key,
        session_file,
        created: true,
    })
}

/// Unconditionally create a fresh session file and remap `envelope`'s key
/// to it, returning the previous file path if one existed.
pub fn reset_session_file(
    map: &mut SessionMap,
    envelope: &Envelope,
    sessions_root: &Path,
    cwd: &str,
) -> Result<(String, Option<PathBuf>)> {
    let key = session_key(envelope);
    let previous = map.0.get(&key).map(PathBuf::from);

    let session_file = create_session_file(sessions_root, cwd)?;
    map.0.insert(key.clone(), session_file.to_string_lossy().into_owned());

    Ok((key, previous))
}

#[derive(Debug, Serialize)]
struct SessionHeader<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: u32,
    id: Uuid,
    cwd: &'a str,
    timestamp: String,
}

fn create_session_file(sessions_root: &Path, cwd: &str) -> Result<PathBuf> {
    let id = Uuid::now_v7();
    let timestamp = chrono::Utc::now();
    let ts_compact = timestamp.format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let safe_cwd = safe_cwd_segment(cwd);

    let dir = sessions_root.join(&safe_cwd);
    let file_name = format!("{ts_compact}_{id}.jsonl");
    let path = dir.join(file_name);

    let header = SessionHeader {
        kind: "session",
        version: 1,
        id,
        cwd,
        timestamp: timestamp.to_rfc3339(),
    };
    let mut line = serde_json::to_string(&header)?;
    line.push('\n');
    atomic_io::write_text(&path, &line)?;

    Ok(path)
}

fn safe_cwd_segment(cwd: &str) -> String {
    cwd.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn envelope(chat_type: ChatType, chat_id: i64, thread: Option<i64>) -> Envelope {
        Envelope {
            update_id: 1,
            chat_id,
            chat_type,
            user_id: Some(1),
            message_id: 1,
            date: 0,
            text: "hi".into(),
            media: None,
            reply_to_message_id: None,
            is_reply_to_bot: false,
            message_thread_id: thread,
        }
    }

    #[test]
    fn session_key_private_chat() {
        let e = envelope(ChatType::Private, 100, None);
        assert_eq!(session_key(&e), "dm:100");
    }

    #[test]
    fn session_key_group_chat() {
        let e = envelope(ChatType::Group, 200, None);
        assert_eq!(session_key(&e), "group:200");
    }

    #[test]
    fn session_key_with_topic_suffix() {
        let e = envelope(ChatType::Supergroup, 200, Some(9));
        assert_eq!(session_key(&e), "group:200:topic:9");
    }

    #[test]
    fn resolve_creates_fresh_file_for_new_key() {
        let dir = tempdir().unwrap();
        let mut map = SessionMap::default();
        let e = envelope(ChatType::Private, 100, None);
        let outcome = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        assert!(outcome.created);
        assert!(outcome.session_file.exists());
        let header = std::fs::read_to_string(&outcome.session_file).unwrap();
        assert!(header.contains("\"type\":\"session\""));
    }

    #[test]
    fn resolve_reuses_existing_mapped_file() {
        let dir = tempdir().unwrap();
        let mut map = SessionMap::default();
        let e = envelope(ChatType::Private, 100, None);
        let first = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        let second = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        assert!(!second.created);
        assert_eq!(first.session_file, second.session_file);
    }

    #[test]
    fn resolve_recreates_if_mapped_file_missing() {
        let dir = tempdir().unwrap();
        let mut map = SessionMap::default();
        let e = envelope(ChatType::Private, 100, None);
        let first = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        std::fs::remove_file(&first.session_file).unwrap();

        let second = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        assert!(second.created);
        assert_ne!(first.session_file, second.session_file);
    }

    #[test]
    fn reset_always_creates_new_file_and_returns_previous() {
        let dir = tempdir().unwrap();
        let mut map = SessionMap::default();
        let e = envelope(ChatType::Private, 100, None);
        let first = resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();

        let (_, previous) = reset_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        assert_eq!(previous, Some(first.session_file));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session-map.json");
        let mut map = SessionMap::default();
        let e = envelope(ChatType::Private, 100, None);
        resolve_session_file(&mut map, &e, dir.path(), "/work").unwrap();
        save(&path, &map).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded, map);
    }
}
