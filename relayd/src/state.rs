//! Crash-safe persistence of the single routing value (current thread id).
//!
//! The file on disk is always either the previous fully-written state or the
//! new one: writes go to a uniquely named temp file in the same directory
//! and are renamed over the target, with the temp path removed on every
//! exit path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    pub v: u32,
    #[serde(rename = "currentThreadId")]
    pub current_thread_id: Option<String>,
}

impl Default for RoutingState {
    fn default() -> Self {
        Self {
            v: STATE_SCHEMA_VERSION,
            current_thread_id: None,
        }
    }
}

/// Removes the temp path when dropped. Rename success makes the removal a
/// no-op since the path no longer exists.
struct TempGuard<'a> {
    path: &'a Path,
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path);
    }
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: RoutingState,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RoutingState::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RoutingState {
        &self.state
    }

    /// Read the state file. Missing, unreadable, or wrong-version files are
    /// all treated as empty prior state, never as errors.
    pub fn load(&mut self) {
        self.state = read_state_file(&self.path);
    }

    /// Record a newly observed thread id. Returns `Ok(false)` when the value
    /// is unchanged (no write), `Ok(true)` after a successful persist. The
    /// in-memory value is updated before persisting and is not rolled back
    /// on a write failure; the error is the caller's to report.
    pub fn update_current_thread_id(&mut self, thread_id: &str) -> io::Result<bool> {
        if self.state.current_thread_id.as_deref() == Some(thread_id) {
            return Ok(false);
        }

        self.state.current_thread_id = Some(thread_id.to_string());
        write_state_file(&self.path, &self.state)?;
        Ok(true)
    }
}

fn read_state_file(path: &Path) -> RoutingState {
    let Ok(raw) = fs::read_to_string(path) else {
        return RoutingState::default();
    };
    match serde_json::from_str::<RoutingState>(&raw) {
        Ok(state) if state.v == STATE_SCHEMA_VERSION => state,
        _ => RoutingState::default(),
    }
}

fn write_state_file(path: &Path, state: &RoutingState) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    // Unique temp name so concurrent writers cannot race each other's rename.
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp = dir.join(format!(
        "{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        Uuid::new_v4()
    ));

    let _guard = TempGuard { path: &tmp };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)?;
    file.write_all(serde_json::to_string(state)?.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;

    // Make the rename durable against directory-entry loss.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_as_empty_state() {
        let dir = tempdir().expect("tempdir");
        let mut store = StateStore::new(dir.path().join("nope.json"));
        store.load();
        assert_eq!(store.state(), &RoutingState::default());
    }

    #[test]
    fn corrupt_or_wrong_version_files_load_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        fs::write(&path, "not json").unwrap();
        let mut store = StateStore::new(path.clone());
        store.load();
        assert_eq!(store.state().current_thread_id, None);

        fs::write(&path, r#"{"v":2,"currentThreadId":"t1"}"#).unwrap();
        store.load();
        assert_eq!(store.state().current_thread_id, None);

        fs::write(&path, r#"{"v":1,"currentThreadId":"t1"}"#).unwrap();
        store.load();
        assert_eq!(store.state().current_thread_id.as_deref(), Some("t1"));
    }

    #[test]
    fn update_persists_and_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("deep").join("state.json");

        let mut store = StateStore::new(path.clone());
        store.load();
        assert!(store.update_current_thread_id("t-1").unwrap());
        assert!(!store.update_current_thread_id("t-1").unwrap());

        let mut reread = StateStore::new(path);
        reread.load();
        assert_eq!(reread.state().current_thread_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn no_temp_files_survive_a_successful_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let mut store = StateStore::new(path);
        store.update_current_thread_id("t-2").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_persist_keeps_memory_value_and_old_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"v":1,"currentThreadId":"old"}"#).unwrap();

        let mut store = StateStore::new(path.clone());
        store.load();

        // Replace the parent directory path with a file to force the write
        // to fail before any rename can happen.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, "file, not dir").unwrap();
        let mut failing = StateStore::new(blocked.join("state.json"));
        failing.load();
        assert!(failing.update_current_thread_id("new").is_err());
        // Memory was updated optimistically.
        assert_eq!(failing.state().current_thread_id.as_deref(), Some("new"));

        // The unrelated previous file is untouched byte for byte.
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            r#"{"v":1,"currentThreadId":"old"}"#
        );
    }

    #[test]
    fn crash_between_temp_write_and_rename_leaves_old_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let old = serde_json::to_string(&RoutingState {
            v: 1,
            current_thread_id: Some("old".into()),
        })
        .unwrap();
        fs::write(&path, &old).unwrap();

        // Simulate the crash: the temp file exists, the rename never ran.
        let tmp = dir.path().join("state.json.12345.deadbeef.tmp");
        fs::write(
            &tmp,
            serde_json::to_string(&RoutingState {
                v: 1,
                current_thread_id: Some("new".into()),
            })
            .unwrap(),
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), old);
        let mut store = StateStore::new(path);
        store.load();
        assert_eq!(store.state().current_thread_id.as_deref(), Some("old"));
    }
}
