//! On-disk layout (§6): the bridge's data root and well-known file names
//! within it.

use std::path::{Path, PathBuf};

/// All well-known paths under the bridge's data root (`~/.rho/telegram/`
//  by default).
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.rho/telegram/`, falling back to `./.rho/telegram`
    /// if the home directory cannot be resolved.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".rho").join("telegram"))
            .unwrap_or_else(|| PathBuf::from(".rho/telegram"))
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn worker_lock(&self) -> PathBuf {
        self.root.join("worker.lock.json")
    }

    pub fn check_trigger(&self) -> PathBuf {
        self.root.join("check-trigger.json")
    }

    pub fn inbound_queue(&self) -> PathBuf {
        self.root.join("inbound.queue.json")
    }

    pub fn outbound_queue(&self) -> PathBuf {
        self.root.join("outbound.queue.json")
    }

    pub fn jobs(&self) -> PathBuf {
        self.root.join("jobs.json")
    }

    pub fn session_map(&self) -> PathBuf {
        self.root.join("session-map.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn pending_approvals(&self) -> PathBuf {
        self.root.join("pending-approvals.json")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("log.jsonl")
    }
}

/// Default agent session root: `~/.pi/agent/sessions/`.
pub fn default_sessions_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".pi").join("agent").join("sessions"))
        .unwrap_or_else(|| PathBuf::from(".pi/agent/sessions"))
}

pub fn ensure_root_exists(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_paths_are_under_root() {
        let paths = DataPaths::new("/tmp/rho-test");
        assert_eq!(paths.state(), PathBuf::from("/tmp/rho-test/state.json"));
        assert_eq!(paths.worker_lock(), PathBuf::from("/tmp/rho-test/worker.lock.json"));
        assert_eq!(paths.jobs(), PathBuf::from("/tmp/rho-test/jobs.json"));
    }
}
