//! Check trigger (C3): a cross-process "poll now" request.
//!
//! The control plane writes this file; the worker consumes it by comparing
//! mtimes rather than deleting-then-racing, so a request posted between two
//! worker ticks is never missed and never double-fired. The schema is
//! frozen at v1 per the control-plane coexistence note: readers must reject
//! anything that doesn't match it rather than guess at an upgrade path.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::atomic_io;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequesterRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckTriggerRequest {
    pub version: u32,
    #[serde(rename = "requestedAt")]
    pub requested_at: i64,
    #[serde(rename = "requesterPid")]
    pub requester_pid: u32,
    #[serde(rename = "requesterRole")]
    pub requester_role: RequesterRole,
    pub source: String,
}

pub struct ConsumeOutcome {
    pub triggered: bool,
    pub next_seen: i64,
    pub request: Option<CheckTriggerRequest>,
}

/// Write a v1 check-trigger request, atomically.
pub fn request(path: &Path, req: &CheckTriggerRequest) -> Result<()> {
    atomic_io::write_text(path, &serde_json::to_string_pretty(req)?)
}

/// Consume the trigger at `path` if it has changed since `last_seen_mtime_ms`.
///
/// Not triggered if the file is missing, its mtime hasn't advanced, or its
/// content fails v1 validation (missing numeric fields, wrong version, or
/// an empty `source`). On a successful consume the file is best-effort
/// deleted so a future write's mtime is unambiguous.
pub fn consume(path: &Path, last_seen_mtime_ms: i64) -> Result<ConsumeOutcome> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConsumeOutcome {
                triggered: false,
                next_seen: last_seen_mtime_ms,
                request: None,
            });
        }
        Err(e) => return Err(crate::error::BridgeError::io(path, e)),
    };

    let mtime_ms = mtime_millis(&metadata);
    if mtime_ms <= last_seen_mtime_ms {
        return Ok(ConsumeOutcome {
            triggered: false,
            next_seen: last_seen_mtime_ms,
            request: None,
        });
    }

    let content = std::fs::read_to_string(path).map_err(|e| crate::error::BridgeError::io(path, e))?;
    let parsed: Option<CheckTriggerRequest> = serde_json::from_str(&content)
        .ok()
        .filter(|r: &CheckTriggerRequest| r.version == 1 && !r.source.is_empty());

    let _ = std::fs::remove_file(path);

    Ok(ConsumeOutcome {
        triggered: parsed.is_some(),
        next_seen: mtime_ms,
        request: parsed,
    })
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_request() -> CheckTriggerRequest {
        CheckTriggerRequest {
            version: 1,
            requested_at: 1700000000000,
            requester_pid: 42,
            requester_role: RequesterRole::Leader,
            source: "control-plane".to_string(),
        }
    }

    #[test]
    fn consume_missing_file_is_not_triggered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check-trigger.json");
        let outcome = consume(&path, 0).unwrap();
        assert!(!outcome.triggered);
    }

    #[test]
    fn request_then_consume_triggers_exactly_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check-trigger.json");
        request(&path, &sample_request()).unwrap();

        let first = consume(&path, 0).unwrap();
        assert!(first.triggered);
        assert!(first.request.is_some());

        let second = consume(&path, first.next_seen).unwrap();
        assert!(!second.triggered);
    }

    #[test]
    fn consume_deletes_file_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check-trigger.json");
        request(&path, &sample_request()).unwrap();
        consume(&path, 0).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rejects_wrong_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check-trigger.json");
        atomic_io::write_text(
            &path,
            r#"{"version":2,"requestedAt":1,"requesterPid":1,"requesterRole":"leader","source":"x"}"#,
        )
        .unwrap();
        let outcome = consume(&path, 0).unwrap();
        assert!(!outcome.triggered);
    }

    #[test]
    fn rejects_empty_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check-trigger.json");
        atomic_io::write_text(
            &path,
            r#"{"version":1,"requestedAt":1,"requesterPid":1,"requesterRole":"leader","source":""}"#,
        )
        .unwrap();
        let outcome = consume(&path, 0).unwrap();
        assert!(!outcome.triggered);
    }
}
