use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::storage::{PersistentState, Storage, StorageError};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// Terminal: shut down, or stopped after a persistence failure.
    Down,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
            RaftRole::Down => write!(f, "down"),
        }
    }
}

/// Replication progress, only present while leading.
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,
    /// Peers with an AppendEntries call currently outstanding.
    pub in_flight: HashSet<u64>,
}

impl LeaderState {
    fn new(peer_ids: &[u64], last_log_index: u64) -> Self {
        let mut leader = Self::default();
        for &peer_id in peer_ids {
            leader.next_index.insert(peer_id, last_log_index + 1);
            leader.match_index.insert(peer_id, 0);
        }
        leader
    }
}

/// All mutable consensus state of one replica.
///
/// The whole aggregate sits behind a single lock in [`RaftNode`]; every
/// transition below is meant to be called with that lock held.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term:
/// - Each node votes for at most one candidate per term (`voted_for`), and
///   the vote is persisted before it is reported
/// - Candidate must receive votes from a majority of the cluster
///
/// ## Leader Append-Only
/// Leaders only append via `append_entry()`. Truncation happens only on
/// followers, through `RaftLog::merge`, when an entry conflicts with the
/// current leader's log.
///
/// ## Log Matching
/// `AppendEntries` consistency check on `(prev_log_index, prev_log_term)`;
/// conflicting suffixes are truncated before new entries are appended.
///
/// ## Leader Completeness
/// - Vote restriction: candidates must have up-to-date logs
/// - Leaders only count replicas towards commitment for entries from their
///   current term (`advance_commit_index`)
///
/// ## State Machine Safety
/// `last_applied <= commit_index`, and `commit_index` never decreases.
///
/// [`RaftNode`]: crate::raft::RaftNode
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: RaftRole,
    pub leader_id: Option<u64>,
    pub election_deadline: Instant,

    // Votes received in the current election (candidates only)
    pub votes_received: HashSet<u64>,

    // Volatile state on leaders (reinitialized after election)
    pub leader: Option<LeaderState>,

    /// Set when a persistent field changed and has not been written yet.
    dirty: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            election_deadline: Instant::now(),
            votes_received: HashSet::new(),
            leader: None,
            dirty: false,
        }
    }

    /// Restore from what was loaded off stable storage. Volatile state
    /// always starts fresh.
    pub fn from_persistent(persisted: PersistentState) -> Self {
        Self {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: RaftLog::from_entries(persisted.log),
            ..Self::new()
        }
    }

    pub fn persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries().to_vec(),
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write term, vote, and log if any of them changed.
    ///
    /// A failed write makes it unsafe to answer anything that depends on the
    /// new state, so the replica goes down.
    pub fn persist_if_dirty(&mut self, storage: &dyn Storage) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        match storage.persist(&self.persistent()) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    term = self.current_term,
                    error = %e,
                    "Failed to persist Raft state, stopping replica"
                );
                self.become_down();
                Err(e)
            }
        }
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn is_down(&self) -> bool {
        self.role == RaftRole::Down
    }

    /// Append a new entry in the current term, returning its index.
    pub fn append_entry(&mut self, command: Vec<u8>) -> u64 {
        let index = self.log.append(self.current_term, command);
        self.dirty = true;
        index
    }

    /// Adopt `term` if it is newer, clearing the vote cast in the old term.
    /// Returns true if the term changed.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// Transition to follower state, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: u64) {
        if self.role == RaftRole::Down {
            return;
        }
        self.observe_term(term);
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        self.leader = None;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received.clear();
        self.votes_received.insert(my_id); // Vote for self
        self.leader_id = None;
        self.leader = None;
        self.dirty = true;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.votes_received.clear();
        self.leader = Some(LeaderState::new(peer_ids, self.last_log_index()));
    }

    pub fn become_down(&mut self) {
        self.role = RaftRole::Down;
        self.leader = None;
        self.votes_received.clear();
    }

    /// Record a granted vote for `candidate_id` in the current term.
    pub fn record_vote(&mut self, candidate_id: u64) {
        if self.voted_for != Some(candidate_id) {
            self.voted_for = Some(candidate_id);
            self.dirty = true;
        }
    }

    /// Raise the commit index. Never moves it backwards.
    pub fn set_commit_index(&mut self, index: u64) -> bool {
        let index = index.min(self.last_log_index());
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    /// Advance the commit index to the highest position replicated on a
    /// quorum (counting the leader itself) whose entry is from the current
    /// term. Returns true if it moved.
    pub fn advance_commit_index(&mut self, quorum: usize) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };

        let mut match_indices: Vec<u64> = leader.match_index.values().copied().collect();
        match_indices.push(self.last_log_index());
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = match_indices.get(quorum.saturating_sub(1)) else {
            return false;
        };
        if candidate <= self.commit_index {
            return false;
        }
        // Terms never decrease along the log, so if `candidate` is from an
        // older term every earlier position is too.
        if self.log.term_at(candidate) != Some(self.current_term) {
            return false;
        }
        self.commit_index = candidate;
        true
    }

    /// Committed entries not yet handed to the state machine. Advances
    /// `last_applied` past them.
    pub fn take_committed_entries(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            match self.log.get(next) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            self.last_applied = next;
        }
        entries
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
