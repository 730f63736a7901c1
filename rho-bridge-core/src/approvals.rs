//! Pending-approval PINs (§4.7, §6).
//!
//! When a strict-allowlist deny is a first contact from a chat or user,
//! the worker issues a 6-digit PIN unique within the pending set and
//! replies once; subsequent messages from the same blocked identity do
//! not generate another PIN.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::atomic_io;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    pub pin: String,
    #[serde(rename = "chatId")]
    pub chat_id: i64,
    #[serde(rename = "userId")]
    pub user_id: Option<i64>,
    #[serde(rename = "requestedAtMs")]
    pub requested_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingApprovals(Vec<PendingApproval>);

pub fn load(path: &Path) -> PendingApprovals {
    atomic_io::load_json_or_default(path, PendingApprovals::default())
}

pub fn save(path: &Path, approvals: &PendingApprovals) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(&approvals.0)?)
}

impl PendingApprovals {
    /// Whether this chat/user pair already has a pending approval.
    pub fn has_pending(&self, chat_id: i64, user_id: Option<i64>) -> bool {
        self.0.iter().any(|a| a.chat_id == chat_id && a.user_id == user_id)
    }

    /// Upsert a pending approval for `chat_id`/`user_id`, returning the PIN
    /// to share with the caller. Idempotent: a second call for the same
    /// identity returns the existing PIN rather than minting a new one.
    pub fn upsert(&mut self, chat_id: i64, user_id: Option<i64>, now_ms: i64) -> String {
        if let Some(existing) = self.0.iter().find(|a| a.chat_id == chat_id && a.user_id == user_id) {
            return existing.pin.clone();
        }

        let pin = self.fresh_unique_pin();
        self.0.push(PendingApproval {
            pin: pin.clone(),
            chat_id,
            user_id,
            requested_at_ms: now_ms,
        });
        pin
    }

    fn fresh_unique_pin(&self) -> String {
        loop {
            let candidate = format!("{:06}", rand::rng().random_range(0..1_000_000));
            if !self.0.iter().any(|a| a.pin == candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upsert_is_idempotent_for_same_identity() {
        let mut approvals = PendingApprovals::default();
        let first = approvals.upsert(100, Some(999), 1000);
        let second = approvals.upsert(100, Some(999), 2000);
        assert_eq!(first, second);
        assert_eq!(approvals.0.len(), 1);
    }

    #[test]
    fn upsert_produces_six_digit_pin() {
        let mut approvals = PendingApprovals::default();
        let pin = approvals.upsert(100, Some(999), 1000);
        assert_eq!(pin.len(), 6);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn different_identities_get_distinct_entries() {
        let mut approvals = PendingApprovals::default();
        approvals.upsert(100, Some(1), 0);
        approvals.upsert(100, Some(2), 0);
        assert_eq!(approvals.0.len(), 2);
    }

    #[test]
    fn has_pending_reflects_state() {
        let mut approvals = PendingApprovals::default();
        assert!(!approvals.has_pending(100, Some(1)));
        approvals.upsert(100, Some(1), 0);
        assert!(approvals.has_pending(100, Some(1)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending-approvals.json");
        let mut approvals = PendingApprovals::default();
        approvals.upsert(100, Some(1), 0);
        save(&path, &approvals).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded, approvals);
    }
}
