//! The key-value state machine that committed log entries are applied to.
//!
//! The consensus layer treats commands as opaque bytes. `KvCommand` is the
//! encoding this store understands; the result of each apply is an encoded
//! `KvOutcome` handed back to whoever submitted the entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Applies committed entries, in log order, to replicated application state.
pub trait StateMachine: Send + Sync {
    /// Apply the command committed at `index` and return its encoded result.
    fn apply(&self, index: u64, command: &[u8]) -> Vec<u8>;
}

/// Commands replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Result of applying one `KvCommand`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvOutcome {
    /// Value the key held before the command.
    pub previous: Option<String>,
    /// Set when the entry could not be decoded; the entry is skipped.
    pub error: Option<String>,
}

impl KvOutcome {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// In-memory key-value store. Each replica has its own; Raft keeps them
/// identical by applying the same entries in the same order.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<String, String>>,
    last_applied: AtomicU64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Local read of applied state; no consensus round.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data().clone()
    }

    /// Index of the last entry applied to this store.
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }
}

impl StateMachine for KvStore {
    fn apply(&self, index: u64, command: &[u8]) -> Vec<u8> {
        let outcome = match KvCommand::decode(command) {
            Ok(KvCommand::Put { key, value }) => {
                tracing::trace!(index, key = %key, "Applying put");
                KvOutcome {
                    previous: self.data().insert(key, value),
                    error: None,
                }
            }
            Ok(KvCommand::Delete { key }) => {
                tracing::trace!(index, key = %key, "Applying delete");
                KvOutcome {
                    previous: self.data().remove(&key),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping undecodable log entry");
                KvOutcome {
                    previous: None,
                    error: Some(e.to_string()),
                }
            }
        };
        self.last_applied.store(index, Ordering::SeqCst);
        outcome.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Vec<u8> {
        KvCommand::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn apply_put_and_overwrite() {
        let store = KvStore::new();
        let first = KvOutcome::decode(&store.apply(1, &put("k", "v1"))).unwrap();
        assert_eq!(first.previous, None);

        let second = KvOutcome::decode(&store.apply(2, &put("k", "v2"))).unwrap();
        assert_eq!(second.previous.as_deref(), Some("v1"));
        assert_eq!(store.get("k").as_deref(), Some("v2"));
        assert_eq!(store.last_applied(), 2);
    }

    #[test]
    fn apply_delete() {
        let store = KvStore::new();
        store.apply(1, &put("k", "v"));
        let delete = KvCommand::Delete {
            key: "k".to_string(),
        }
        .encode()
        .unwrap();
        let outcome = KvOutcome::decode(&store.apply(2, &delete)).unwrap();
        assert_eq!(outcome.previous.as_deref(), Some("v"));
        assert!(store.get("k").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn undecodable_entry_is_skipped() {
        let store = KvStore::new();
        let outcome = KvOutcome::decode(&store.apply(1, b"garbage")).unwrap();
        assert!(outcome.error.is_some());
        assert!(store.is_empty());
        assert_eq!(store.last_applied(), 1);
    }

    #[test]
    fn command_encoding_is_tagged() {
        let bytes = KvCommand::Delete {
            key: "a".to_string(),
        }
        .encode()
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(json["key"], "a");
    }
}
