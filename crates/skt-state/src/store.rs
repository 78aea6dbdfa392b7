//! Atomic persistence of `RunState` inside the rc file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StateError;
use crate::schema::{RunState, SCHEMA_VERSION};
use crate::Result;

/// Name of the rc-file table holding the run state.
const STATE_TABLE: &str = "state";

/// Rc-file backed state store.
///
/// The rc file is a TOML document; this store only owns its `[state]`
/// table and keeps every other table as it found it.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the run state.
    ///
    /// A missing file or a file without a `[state]` table yields an empty
    /// `RunState`. Anything unparsable is `StateError::Corrupt`.
    pub fn load(&self) -> Result<RunState> {
        let doc = self.read_document()?;
        let Some(value) = doc.get(STATE_TABLE) else {
            debug!(path = %self.path.display(), "no saved state");
            return Ok(RunState::default());
        };

        let state: RunState = value.clone().try_into().map_err(|e: toml::de::Error| {
            StateError::Corrupt {
                path: self.path.clone(),
                reason: e.message().to_string(),
            }
        })?;

        if state.schema_version > SCHEMA_VERSION {
            return Err(StateError::UnsupportedSchema {
                found: state.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(state)
    }

    /// Replace the `[state]` table with `state`.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let mut doc = self.read_document()?;
        let value = toml::Value::try_from(state)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        doc.insert(STATE_TABLE.to_string(), value);
        self.write_document(&doc)?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    /// Drop the `[state]` table, keeping the rest of the rc file.
    pub fn clear(&self) -> Result<()> {
        let mut doc = self.read_document()?;
        if doc.remove(STATE_TABLE).is_some() {
            self.write_document(&doc)?;
            debug!(path = %self.path.display(), "state cleared");
        }
        Ok(())
    }

    fn read_document(&self) -> Result<toml::Table> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(toml::Table::new()),
            Err(e) => return Err(StateError::io(&self.path, e)),
        };

        raw.parse::<toml::Table>().map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.message().to_string(),
        })
    }

    fn write_document(&self, doc: &toml::Table) -> Result<()> {
        let content =
            toml::to_string_pretty(doc).map_err(|e| StateError::Serialization(e.to_string()))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;

        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StateError::io(&dir, e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StateError::io(&self.path, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BaseCheckout, MergeRecord, MergedTree, StageResult};

    fn make_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("sktrc"));
        (dir, store)
    }

    fn merged_state() -> RunState {
        let mut state = RunState::default();
        state.workdir = Some(PathBuf::from("/work"));
        state.record_merge(MergeRecord {
            failed_patch: None,
            merge_log: None,
            result: StageResult::success("ok"),
            base: BaseCheckout {
                repo: "https://example.com/linux.git".to_string(),
                git_ref: "master".to_string(),
                head: "abc".to_string(),
                commit_date: 1,
            },
            merged: Some(MergedTree {
                path: PathBuf::from("/work"),
                head: "def".to_string(),
                tree_id: "123".to_string(),
            }),
            patches: vec![],
        });
        state
    }

    #[test]
    fn missing_file_loads_default() {
        let (_dir, store) = make_store();
        assert_eq!(store.load().unwrap(), RunState::default());
    }

    #[test]
    fn file_without_state_table_loads_default() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "[config]\nbaserepo = \"x\"\n").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn garbage_is_corrupt() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "this is = = not toml").unwrap();
        match store.load() {
            Err(StateError::Corrupt { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn wrong_shape_state_is_corrupt() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "[state]\nmerge = 42\n").unwrap();
        assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "[state]\nschema_version = 99\n").unwrap();
        assert!(matches!(
            store.load(),
            Err(StateError::UnsupportedSchema { found: 99, .. })
        ));
    }

    #[test]
    fn save_keeps_other_tables() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "[config]\nbaserepo = \"https://example.com\"\n").unwrap();

        store.save(&merged_state()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let doc: toml::Table = raw.parse().unwrap();
        assert_eq!(
            doc["config"]["baserepo"].as_str(),
            Some("https://example.com")
        );
        assert!(doc.contains_key("state"));
    }

    #[test]
    fn clear_removes_only_state() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "[config]\nref = \"v4.19\"\n").unwrap();
        store.save(&merged_state()).unwrap();

        store.clear().unwrap();

        assert!(store.load().unwrap().is_empty());
        let doc: toml::Table = fs::read_to_string(store.path()).unwrap().parse().unwrap();
        assert_eq!(doc["config"]["ref"].as_str(), Some("v4.19"));
    }

    #[test]
    fn clear_on_missing_file_is_noop() {
        let (_dir, store) = make_store();
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn save_refuses_to_clobber_corrupt_rc() {
        let (_dir, store) = make_store();
        fs::write(store.path(), "not = = toml").unwrap();
        assert!(matches!(
            store.save(&merged_state()),
            Err(StateError::Corrupt { .. })
        ));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "not = = toml");
    }
}
