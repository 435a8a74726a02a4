//! Run history persisted between engine sessions.
//!
//! Only the bookkeeping needed to answer "has this task run, and with which
//! implementation" is stored. Declared artifacts and bodies are not; they are
//! supplied again by whoever registers the task in the next session.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Fingerprint;
use crate::error::StateError;

const STATE_FILE: &str = "state.cbor";
const STATE_VERSION: u32 = 1;

/// Persisted slice of a [`Task`](crate::Task).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TaskRecord {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) creation_time: SystemTime,
    pub(crate) call_time: SystemTime,
    pub(crate) fingerprint: Fingerprint,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    tasks: BTreeMap<String, TaskRecord>,
}

/// Reads and writes the CBOR state file under the state directory.
#[derive(Debug, Clone)]
pub(crate) struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    pub(crate) fn new(state_dir: &Utf8Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads every record. A missing file is an empty history.
    pub(crate) fn try_load(&self) -> Result<BTreeMap<String, TaskRecord>, StateError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let state: StateFile = ciborium::from_reader(BufReader::new(file))?;
        if state.version != STATE_VERSION {
            return Err(StateError::Version(state.version));
        }

        Ok(state.tasks)
    }

    /// Like [`StateStore::try_load`], except that an unreadable file is
    /// reported and treated as an empty history.
    pub(crate) fn load(&self) -> BTreeMap<String, TaskRecord> {
        match self.try_load() {
            Ok(tasks) => {
                tracing::debug!("loaded {} task records from {}", tasks.len(), self.path);
                tasks
            }
            Err(e) => {
                tracing::warn!("ignoring state file {}: {}", self.path, e);
                BTreeMap::new()
            }
        }
    }

    /// Replaces the state file atomically: the new contents are written next
    /// to it and renamed over it.
    pub(crate) fn save(
        &self,
        records: impl IntoIterator<Item = TaskRecord>,
    ) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let state = StateFile {
            version: STATE_VERSION,
            tasks: records
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect(),
        };

        let temp = self.path.with_extension("cbor.tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(&state, &mut writer)?;
            writer.flush()?;
        }
        fs::rename(&temp, &self.path)?;

        tracing::debug!("saved {} task records to {}", state.tasks.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::NEVER;

    fn record(name: &str, call: u64) -> TaskRecord {
        TaskRecord {
            name: name.into(),
            description: Some(format!("{name} task")),
            creation_time: NEVER + Duration::from_secs(1),
            call_time: NEVER + Duration::from_nanos(call),
            fingerprint: Fingerprint::hash(name),
        }
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join(".dotry");
        let store = StateStore::new(&root);
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.try_load().unwrap().is_empty());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = store();
        let records = vec![record("a", 1_000_000_123), record("b", 0)];

        store.save(records.clone()).unwrap();
        let loaded = store.try_load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a"], records[0]);
        assert_eq!(loaded["b"].call_time, NEVER);
        assert!(!store.path().with_extension("cbor.tmp").exists());
    }

    #[test]
    fn test_save_replaces_previous_contents() {
        let (_dir, store) = store();
        store.save([record("a", 1), record("b", 2)]).unwrap();
        store.save([record("b", 3)]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), ["b"]);
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"definitely not cbor").unwrap();

        assert!(store.try_load().is_err());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        let future = StateFile {
            version: STATE_VERSION + 1,
            tasks: BTreeMap::new(),
        };
        ciborium::into_writer(&future, File::create(store.path()).unwrap()).unwrap();

        assert!(matches!(store.try_load(), Err(StateError::Version(v)) if v == STATE_VERSION + 1));
        assert!(store.load().is_empty());
    }
}
