//! Runtime state (C4): persistent poll offset, counters, and last-check
//! metadata.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::atomic_io;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeState {
    #[serde(default)]
    pub last_update_id: i64,
    #[serde(default)]
    pub last_poll_at: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub last_check_triggered_at: Option<i64>,
    #[serde(default)]
    pub last_check_source: Option<String>,
}

fn default_mode() -> String {
    "polling".to_string()
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            last_update_id: 0,
            last_poll_at: None,
            consecutive_failures: 0,
            mode: default_mode(),
            last_check_triggered_at: None,
            last_check_source: None,
        }
    }
}

/// Load state from `path`, defaulting to a fresh [`RuntimeState`] on any
/// parse error or missing file.
pub fn load(path: &Path) -> RuntimeState {
    atomic_io::load_json_or_default(path, RuntimeState::default())
}

/// Persist `state` to `path` atomically.
pub fn save(path: &Path, state: &RuntimeState) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(state)?)
}

/// `max(current, max(update_ids) + 1)`, or `current` if `update_ids` is empty.
pub fn advance_update_offset(current: i64, update_ids: &[i64]) -> i64 {
    match update_ids.iter().max() {
        Some(&max_id) => current.max(max_id + 1),
        None => current,
    }
}

impl RuntimeState {
    pub fn mark_poll_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_poll_at = Some(Utc::now().to_rfc3339());
    }

    pub fn mark_poll_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn mark_check_triggered(&mut self, at_ms: i64, source: impl Into<String>) {
        self.last_check_triggered_at = Some(at_ms);
        self.last_check_source = Some(source.into());
    }
}

/// Default path for the runtime state file under the bridge's data root.
pub fn default_path(root: &Path) -> PathBuf {
    root.join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn advance_offset_with_empty_ids_is_noop() {
        assert_eq!(advance_update_offset(10, &[]), 10);
    }

    #[test]
    fn advance_offset_takes_max_plus_one() {
        assert_eq!(advance_update_offset(10, &[3, 20, 7]), 21);
    }

    #[test]
    fn advance_offset_never_decreases() {
        assert_eq!(advance_update_offset(100, &[3, 4]), 100);
    }

    #[test]
    fn load_defaults_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = load(&path);
        assert_eq!(state, RuntimeState::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = RuntimeState::default();
        state.last_update_id = 42;
        state.mark_poll_success();
        save(&path, &state).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.last_update_id, 42);
        assert_eq!(loaded.consecutive_failures, 0);
        assert!(loaded.last_poll_at.is_some());
    }

    #[test]
    fn mark_poll_failure_increments_counter() {
        let mut state = RuntimeState::default();
        state.mark_poll_failure();
        state.mark_poll_failure();
        assert_eq!(state.consecutive_failures, 2);
        state.mark_poll_success();
        assert_eq!(state.consecutive_failures, 0);
    }
}
