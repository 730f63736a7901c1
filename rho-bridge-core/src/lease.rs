//! Lease lock (C2): exclusive file-based ownership with staleness detection.
//!
//! Exactly one live lease can exist per path at a time, given atomic rename
//! semantics on a shared filesystem and honest nonce checks by every
//! participant. A lease holder must refresh at a cadence of at most
//! `stale_ms / 3` or risk another process taking over.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::atomic_io;
use crate::error::Result;

/// On-disk lease payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeasePayload {
    pub pid: u32,
    pub nonce: String,
    pub purpose: String,
    pub hostname: String,
    pub acquired_at: i64,
    pub refreshed_at: i64,
}

/// Outcome of a [`try_acquire`] call.
pub struct AcquireOutcome {
    pub ok: bool,
    pub lease: Option<LeaseHandle>,
    pub owner_pid: Option<u32>,
}

/// A held lease. Callers refresh it on a timer and release it on shutdown.
pub struct LeaseHandle {
    path: PathBuf,
    nonce: String,
}

impl LeaseHandle {
    /// Rewrite `refreshed_at` to `now`, but only if the file on disk still
    /// carries this handle's pid+nonce. Returns `false` (lease lost) if the
    /// payload has changed or the file is missing.
    pub fn refresh(&self, now: i64) -> Result<bool> {
        let Some(mut payload) = read_owner(&self.path)? else {
            return Ok(false);
        };
        if payload.nonce != self.nonce || payload.pid != std::process::id() {
            return Ok(false);
        }
        payload.refreshed_at = now;
        atomic_io::write_text(&self.path, &serde_json::to_string_pretty(&payload)?)?;
        Ok(true)
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

/// Try to acquire the lease at `path`.
///
/// Succeeds if no lease file exists, or if the existing payload is stale.
/// On success, writes a fresh payload and returns a [`LeaseHandle`].
pub fn try_acquire(
    path: &Path,
    nonce: String,
    now: i64,
    stale_ms: i64,
    purpose: &str,
) -> Result<AcquireOutcome> {
    if let Some(existing) = read_owner(path)? {
        if !is_stale(&existing, stale_ms, now) {
            return Ok(AcquireOutcome {
                ok: false,
                lease: None,
                owner_pid: Some(existing.pid),
            });
        }
    }

    let payload = LeasePayload {
        pid: std::process::id(),
        nonce: nonce.clone(),
        purpose: purpose.to_string(),
        hostname: hostname(),
        acquired_at: now,
        refreshed_at: now,
    };
    atomic_io::write_text(path, &serde_json::to_string_pretty(&payload)?)?;

    Ok(AcquireOutcome {
        ok: true,
        lease: Some(LeaseHandle {
            path: path.to_path_buf(),
            nonce,
        }),
        owner_pid: Some(payload.pid),
    })
}

/// Release a held lease, deleting the file iff the current payload's nonce
/// still matches. A missing file is treated as already released.
pub fn release(handle: &LeaseHandle) -> Result<()> {
    match read_owner(&handle.path)? {
        Some(payload) if payload.nonce == handle.nonce => {
            let _ = std::fs::remove_file(&handle.path);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Read the current lease payload at `path`, if any and well-formed.
pub fn read_owner(path: &Path) -> Result<Option<LeasePayload>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(crate::error::BridgeError::io(path, e)),
    }
}

pub fn is_stale(payload: &LeasePayload, stale_ms: i64, now: i64) -> bool {
    now - payload.refreshed_at > stale_ms
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_on_empty_path_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        let outcome = try_acquire(&path, "nonce-a".into(), 1000, 90_000, "worker").unwrap();
        assert!(outcome.ok);
        assert!(outcome.lease.is_some());
    }

    #[test]
    fn second_acquire_fails_while_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        let first = try_acquire(&path, "nonce-a".into(), 1000, 90_000, "worker").unwrap();
        assert!(first.ok);

        let second = try_acquire(&path, "nonce-b".into(), 2000, 90_000, "worker").unwrap();
        assert!(!second.ok);
        assert_eq!(second.owner_pid, Some(std::process::id()));
    }

    #[test]
    fn acquire_succeeds_over_stale_lease() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        try_acquire(&path, "nonce-a".into(), 1000, 90_000, "worker").unwrap();

        let now = 1000 + 90_001;
        let second = try_acquire(&path, "nonce-b".into(), now, 90_000, "worker").unwrap();
        assert!(second.ok);
    }

    #[test]
    fn refresh_fails_if_nonce_no_longer_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        let outcome = try_acquire(&path, "nonce-a".into(), 1000, 90_000, "worker").unwrap();
        let handle = outcome.lease.unwrap();

        // Someone else takes over after staleness.
        let stolen_payload = LeasePayload {
            pid: 99999,
            nonce: "nonce-b".into(),
            purpose: "worker".into(),
            hostname: "other".into(),
            acquired_at: 200_000,
            refreshed_at: 200_000,
        };
        atomic_io::write_text(&path, &serde_json::to_string(&stolen_payload).unwrap()).unwrap();

        let refreshed = handle.refresh(300_000).unwrap();
        assert!(!refreshed);
    }

    #[test]
    fn release_deletes_file_when_nonce_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        let outcome = try_acquire(&path, "nonce-a".into(), 1000, 90_000, "worker").unwrap();
        let handle = outcome.lease.unwrap();

        release(&handle).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn release_is_noop_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.lock.json");
        let handle = LeaseHandle {
            path: path.clone(),
            nonce: "nonce-a".into(),
        };
        release(&handle).unwrap();
    }

    #[test]
    fn is_stale_boundary() {
        let payload = LeasePayload {
            pid: 1,
            nonce: "n".into(),
            purpose: "p".into(),
            hostname: "h".into(),
            acquired_at: 0,
            refreshed_at: 0,
        };
        assert!(!is_stale(&payload, 90_000, 90_000));
        assert!(is_stale(&payload, 90_000, 90_001));
    }
}
