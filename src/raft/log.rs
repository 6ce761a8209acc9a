use serde::{Deserialize, Serialize};

/// A single entry in the replicated log.
///
/// `command` is opaque to the consensus layer; only the state machine
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Append-only log, addressed by 1-based position.
///
/// Position 0 is a sentinel with term 0, so `term_at(0)` always succeeds and
/// an empty log matches `prev_log_index == 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, with the sentinel at 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Consistency check used by AppendEntries.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Entries starting at `start_index` (inclusive).
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    /// Append a new entry created in `term`, returning its index.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Drop `from_index` and everything after it.
    pub fn truncate_from(&mut self, from_index: u64) {
        let keep = from_index.max(1) as usize - 1;
        self.entries.truncate(keep);
    }

    /// Merge entries received from the leader after a successful consistency
    /// check at `prev_index`.
    ///
    /// Entries already present with the same term are left untouched, so a
    /// stale or duplicated request never shortens the log. The first entry
    /// whose term conflicts truncates the local suffix. Returns true if the
    /// log changed.
    pub fn merge(&mut self, prev_index: u64, incoming: Vec<LogEntry>) -> bool {
        let mut changed = false;
        for (offset, entry) in incoming.into_iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => self.truncate_from(index),
                None => {}
            }
            self.entries.push(LogEntry { index, ..entry });
            changed = true;
        }
        changed
    }

    /// Backtrack hint for a rejected AppendEntries: the highest position this
    /// log may still share with the leader.
    ///
    /// If the entry at `prev_index` is missing, that is our last index. If it
    /// exists with a different term, skip the whole run of that term, since
    /// none of it can match the leader.
    pub fn conflict_hint(&self, prev_index: u64) -> u64 {
        match self.term_at(prev_index) {
            None => self.last_index().min(prev_index.saturating_sub(1)),
            Some(conflict_term) => {
                let mut index = prev_index;
                while index > 0 && self.term_at(index) == Some(conflict_term) {
                    index -= 1;
                }
                index
            }
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_index())
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}
