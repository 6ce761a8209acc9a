//! Durable storage for the state Raft requires to survive restarts:
//! the current term, the vote cast in that term, and the log.
//!
//! Every write replaces the whole persisted state. `FileStorage` does this
//! crash-atomically by writing a temporary file, syncing it, and renaming it
//! over the previous copy.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::log::LogEntry;

const STATE_FILE: &str = "raft-state.json";
const STATE_TMP_FILE: &str = "raft-state.json.tmp";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Term, vote, and log as written to stable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// Stable storage for [`PersistentState`].
///
/// `persist` must not return until the state is durable; callers reply to
/// RPCs only after it succeeds.
pub trait Storage: Send + Sync {
    fn load(&self) -> Result<PersistentState, StorageError>;

    fn persist(&self, state: &PersistentState) -> Result<(), StorageError>;
}

/// JSON file in a data directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<PersistentState, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(PersistentState::default());
        }
        let contents = fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    fn persist(&self, state: &PersistentState) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(state)?;

        let tmp_path = self.dir.join(STATE_TMP_FILE);
        let mut file = File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp_path, self.state_path())?;

        // Make the rename itself durable.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// In-process storage. Clones of an `Arc<MemoryStorage>` survive a node
/// being dropped and rebuilt, which is how tests simulate a restart.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<PersistentState>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PersistentState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<PersistentState, StorageError> {
        Ok(self.snapshot())
    }

    fn persist(&self, state: &PersistentState) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected("write failure injected".into()));
        }
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StorageError::Rejected("storage lock poisoned".into()))?;
        *guard = state.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PersistentState {
        PersistentState {
            current_term: 3,
            voted_for: Some(2),
            log: vec![
                LogEntry {
                    term: 1,
                    index: 1,
                    command: b"first".to_vec(),
                },
                LogEntry {
                    term: 3,
                    index: 2,
                    command: b"second".to_vec(),
                },
            ],
        }
    }

    #[test]
    fn file_storage_fresh_directory_loads_default() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("node-1")).unwrap();
        assert_eq!(storage.load().unwrap(), PersistentState::default());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.persist(&sample_state()).unwrap();
        }
        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), sample_state());
        assert!(!dir.path().join(STATE_TMP_FILE).exists());
    }

    #[test]
    fn file_storage_overwrites_previous_state() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.persist(&sample_state()).unwrap();

        let shorter = PersistentState {
            current_term: 4,
            voted_for: None,
            log: sample_state().log[..1].to_vec(),
        };
        storage.persist(&shorter).unwrap();
        assert_eq!(storage.load().unwrap(), shorter);
    }

    #[test]
    fn file_storage_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(matches!(storage.load(), Err(StorageError::Codec(_))));
    }

    #[test]
    fn file_storage_reports_io_failure() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("node-1");
        let storage = FileStorage::open(&data_dir).unwrap();
        fs::remove_dir_all(&data_dir).unwrap();

        let err = storage.persist(&sample_state()).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn memory_storage_round_trip_and_failure_injection() {
        let storage = MemoryStorage::new();
        storage.persist(&sample_state()).unwrap();
        assert_eq!(storage.load().unwrap(), sample_state());
        assert_eq!(storage.write_count(), 1);

        storage.set_fail_writes(true);
        let err = storage.persist(&PersistentState::default()).unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
        // The failed write left the previous state in place.
        assert_eq!(storage.load().unwrap(), sample_state());
        assert_eq!(storage.write_count(), 1);
    }
}
