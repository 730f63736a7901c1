//! Atomic file I/O (C1).
//!
//! All writes land on disk via a temp-file-then-rename so a reader never
//! observes a partially written file, and ordering between concurrent
//! writers is determined purely by rename order on the underlying
//! filesystem. No fsync is required; the rename is the durability boundary
//! this module relies on.

use std::fs;
use std::path::Path;

use crate::error::{BridgeError, Result};

/// Write `content` to `path` atomically.
///
/// Creates `path`'s parent directories if missing, writes to a sibling
/// temp file named `<file>.tmp-<pid>-<rand>`, then renames it over `path`.
/// The temp file is removed if any step before the rename fails.
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BridgeError::io(parent, e))?;
    }

    let tmp_path = tmp_path_for(path);
    if let Err(e) = fs::write(&tmp_path, content) {
        let _ = fs::remove_file(&tmp_path);
        return Err(BridgeError::io(&tmp_path, e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(BridgeError::io(path, e));
    }

    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let pid = std::process::id();
    let rand: u32 = rand::random();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!("{file_name}.tmp-{pid}-{rand:08x}"))
}

/// Ensure `path` exists and contains a JSON array; writes `"[]"` if the file
/// is missing.
pub fn ensure_json_array_file(path: &Path) -> Result<()> {
    if !path.exists() {
        write_text(path, "[]")?;
    }
    Ok(())
}

/// Load JSON from `path`, returning `default` if the file is missing or
/// fails to parse.
pub fn load_json_or_default<T>(path: &Path, default: T) -> T
where
    T: serde::de::DeserializeOwned,
{
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_text_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deep/file.json");
        write_text(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn write_text_leaves_no_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_text(&path, "{}").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn ensure_json_array_file_creates_empty_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        ensure_json_array_file(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
    }

    #[test]
    fn ensure_json_array_file_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        write_text(&path, r#"[{"a":1}]"#).unwrap();
        ensure_json_array_file(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"[{"a":1}]"#);
    }

    #[test]
    fn load_json_or_default_falls_back_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let value: Vec<i32> = load_json_or_default(&path, vec![1, 2, 3]);
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn load_json_or_default_falls_back_on_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        fs::write(&path, "not json").unwrap();
        let value: Vec<i32> = load_json_or_default(&path, vec![]);
        assert_eq!(value, Vec::<i32>::new());
    }
}
