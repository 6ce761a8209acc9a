use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{ReplicaError, Result};
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::peers::{PeerError, PeerSet};
use crate::raft::ready::ReadyBarrier;
use crate::raft::rpc::{handle_append_entries, handle_request_vote, log_entry_to_proto};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::storage::Storage;
use crate::raft::timer::ElectionTimer;
use crate::store::StateMachine;

/// How long `submit` waits for an entry to be committed and applied.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Append a command to the log (leader only). The sender receives the
    /// state machine's result once the entry has been applied.
    AppendCommand {
        command: Vec<u8>,
        response_tx: oneshot::Sender<Result<Applied>>,
    },
    /// Start an election now, as if the election timer had expired.
    TriggerElection,
}

/// A command that made it through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Log position the command was committed at.
    pub index: u64,
    /// What the state machine returned for it.
    pub output: Vec<u8>,
}

/// Point-in-time view of a replica, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// A submitted entry waiting to be applied: the term it was appended in and
/// where to send the result.
type ApplyWaiter = (u64, oneshot::Sender<Result<Applied>>);

/// The main Raft node that coordinates consensus
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: Arc<PeerSet>,
    storage: Arc<dyn Storage>,
    state_machine: Arc<dyn StateMachine>,
    ready: ReadyBarrier,
    timer: ElectionTimer,
    message_tx: mpsc::Sender<RaftMessage>,
    commit_tx: watch::Sender<u64>,
    /// Wakes the event loop when an election won off-loop makes us leader.
    role_changed: Notify,
    pending: Mutex<HashMap<u64, ApplyWaiter>>,
}

impl RaftNode {
    /// Build a node from configuration, restoring term, vote, and log from
    /// `storage`.
    pub fn new(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        config.validate()?;
        let persisted = storage.load()?;
        let state = RaftState::from_persistent(persisted);

        tracing::info!(
            node_id = config.node_id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            log_len = state.log.len(),
            "Restored Raft state"
        );

        let (message_tx, message_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0);
        let peers = Arc::new(PeerSet::new(
            config.node_id,
            &config.peers,
            Duration::from_millis(config.rpc_timeout_ms),
        ));

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            ready: ReadyBarrier::new(config.peers.len()),
            timer: ElectionTimer::new(
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
            ),
            config,
            peers,
            storage,
            state_machine,
            message_tx,
            commit_tx,
            role_changed: Notify::new(),
            pending: Mutex::new(HashMap::new()),
        };

        Ok((node, message_rx))
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Receiver that observes every advance of the commit index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    pub fn ready_barrier(&self) -> &ReadyBarrier {
        &self.ready
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn notify_commit(&self, commit_index: u64) {
        self.commit_tx.send_replace(commit_index);
    }

    // ---------------------------------------------------------------------
    // Startup handshake
    // ---------------------------------------------------------------------

    /// Announce ourselves to every peer, then wait for every peer to
    /// announce itself. Both phases share one startup timeout.
    pub async fn complete_handshake(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.startup_timeout_ms);
        self.connect_to_peers(deadline).await?;
        self.wait_until_ready(deadline).await
    }

    /// Dial every peer and announce ourselves with ReplicaReady, giving up
    /// at `deadline`.
    pub async fn connect_to_peers(&self, deadline: Instant) -> Result<()> {
        self.peers
            .announce_to_all(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    /// Inbound ReplicaReady. Counts the sender towards our barrier; if our
    /// barrier had already opened, the sender is a restarted replica waiting
    /// on its own barrier, so announce ourselves back.
    pub async fn handle_replica_ready(&self, replica_id: u64, want_reply: bool) {
        let was_open = self.ready.is_open();
        self.ready.notify(replica_id).await;

        if was_open && want_reply {
            let peers = self.peers.clone();
            tokio::spawn(async move {
                if let Err(e) = peers.announce_to(replica_id, false).await {
                    tracing::debug!(replica_id, error = %e, "Failed to re-announce to peer");
                }
            });
        }
    }

    /// Block until every peer has announced itself, failing at `deadline`.
    pub async fn wait_until_ready(&self, deadline: Instant) -> Result<()> {
        self.ready
            .wait_timeout(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Run the Raft node main loop.
    ///
    /// Waits for the startup barrier first; the election timer does not run
    /// until every peer is known to be reachable. Exits when `shutdown` is
    /// cancelled or the node goes down.
    pub async fn run(
        self: Arc<Self>,
        mut message_rx: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) {
        tokio::select! {
            _ = shutdown.cancelled() => {
                self.shutdown().await;
                return;
            }
            _ = self.ready.wait() => {}
        }

        self.state.write().await.election_deadline = self.timer.next_deadline();
        tracing::info!(node_id = self.id, "Raft event loop started");

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let (role, deadline) = {
                let state = self.state.read().await;
                (state.role, state.election_deadline)
            };
            if role == RaftRole::Down {
                tracing::warn!(node_id = self.id, "Replica is down, stopping event loop");
                self.fail_pending(|| ReplicaError::Down).await;
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown().await;
                    break;
                }

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::AppendCommand { command, response_tx } => {
                            self.handle_append_command(command, response_tx).await;
                        }
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                        }
                    }
                }

                // Re-read the role so the heartbeat arm is enabled
                _ = self.role_changed.notified() => {}

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep_until(deadline), if role != RaftRole::Leader => {
                    self.check_election_timeout().await;
                }

                // Heartbeat interval (for leaders)
                _ = heartbeat.tick(), if role == RaftRole::Leader => {
                    self.broadcast_append_entries().await;
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.state.write().await.become_down();
        self.fail_pending(|| ReplicaError::Down).await;
        tracing::info!(node_id = self.id, "Raft node shut down");
    }

    async fn fail_pending(&self, err: impl Fn() -> ReplicaError) {
        for (_, (_, tx)) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(err()));
        }
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    /// Start an election if the deadline really has passed; it may have been
    /// pushed back while we were sleeping.
    async fn check_election_timeout(self: &Arc<Self>) {
        let expired = {
            let state = self.state.read().await;
            matches!(state.role, RaftRole::Follower | RaftRole::Candidate)
                && Instant::now() >= state.election_deadline
        };
        if expired {
            self.start_election().await;
        }
    }

    /// Start a new election
    async fn start_election(self: &Arc<Self>) {
        let req = {
            let mut state = self.state.write().await;
            if !matches!(state.role, RaftRole::Follower | RaftRole::Candidate) {
                return;
            }

            state.become_candidate(self.id);
            state.election_deadline = self.timer.next_deadline();
            if state.persist_if_dirty(self.storage.as_ref()).is_err() {
                return;
            }

            tracing::info!(node_id = self.id, term = state.current_term, "Starting election");

            if self.config.quorum() == 1 {
                let peer_ids = self.config.peer_ids();
                state.become_leader(self.id, &peer_ids);
                tracing::info!(node_id = self.id, term = state.current_term, "Became leader");
                return;
            }

            VoteRequest {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };

        let node = self.clone();
        tokio::spawn(async move { node.collect_votes(req).await });
    }

    /// Fan RequestVote out to every peer in parallel and tally the replies as
    /// they arrive. Stops as soon as the outcome is decided.
    async fn collect_votes(self: Arc<Self>, req: VoteRequest) {
        let mut calls = JoinSet::new();
        for peer_id in self.peers.peer_ids().await {
            let peers = self.peers.clone();
            let req = req.clone();
            calls.spawn(async move { (peer_id, peers.request_vote(peer_id, req).await) });
        }

        while let Some(joined) = calls.join_next().await {
            let Ok((peer_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(resp) => {
                    if self.handle_vote_response(peer_id, req.term, resp).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(node_id = self.id, peer_id, error = %e, "Vote request failed");
                }
            }
        }
    }

    /// Apply one vote reply. Returns true once this election is over (won,
    /// superseded, or abandoned).
    async fn handle_vote_response(
        self: &Arc<Self>,
        peer_id: u64,
        term: u64,
        resp: VoteResponse,
    ) -> bool {
        let mut state = self.state.write().await;

        if resp.term > state.current_term {
            tracing::info!(
                node_id = self.id,
                peer_id,
                term = resp.term,
                "Higher term seen in vote reply, stepping down"
            );
            state.become_follower(resp.term);
            state.election_deadline = self.timer.next_deadline();
            let _ = state.persist_if_dirty(self.storage.as_ref());
            return true;
        }
        if state.role != RaftRole::Candidate || state.current_term != term {
            return true;
        }
        if !resp.vote_granted {
            return false;
        }

        state.votes_received.insert(peer_id);
        let votes = state.votes_received.len();
        tracing::debug!(node_id = self.id, peer_id, term, votes, "Received vote");

        if votes < self.config.quorum() {
            return false;
        }

        let peer_ids = self.config.peer_ids();
        state.become_leader(self.id, &peer_ids);
        tracing::info!(node_id = self.id, term, votes, "Became leader");
        drop(state);

        self.role_changed.notify_one();
        self.broadcast_append_entries().await;
        true
    }

    // ---------------------------------------------------------------------
    // Replication (leader only)
    // ---------------------------------------------------------------------

    /// AppendEntries for `peer_id` carrying everything from its next index
    /// onwards; empty when the peer is up to date.
    fn build_append_request(&self, state: &RaftState, peer_id: u64) -> Option<AppendEntriesRequest> {
        let leader = state.leader.as_ref()?;
        let next_index = leader
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(state.last_log_index() + 1)
            .max(1);
        let prev_log_index = next_index - 1;
        let prev_log_term = state.log.term_at(prev_log_index).unwrap_or(0);
        let entries = state
            .log
            .entries_from(next_index)
            .iter()
            .map(log_entry_to_proto)
            .collect();

        Some(AppendEntriesRequest {
            term: state.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.commit_index,
        })
    }

    /// Send AppendEntries to every peer without a call already in flight.
    async fn broadcast_append_entries(self: &Arc<Self>) {
        let requests = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return;
            }

            let mut requests = Vec::new();
            for peer_id in self.config.peer_ids() {
                let busy = state
                    .leader
                    .as_ref()
                    .map_or(true, |l| l.in_flight.contains(&peer_id));
                if busy {
                    continue;
                }
                if let Some(req) = self.build_append_request(&state, peer_id) {
                    requests.push((peer_id, req));
                }
            }
            if let Some(leader) = state.leader.as_mut() {
                for (peer_id, _) in &requests {
                    leader.in_flight.insert(*peer_id);
                }
            }
            requests
        };

        for (peer_id, req) in requests {
            let node = self.clone();
            tokio::spawn(async move { node.replicate_to(peer_id, req).await });
        }
    }

    /// Drive one peer until it is caught up or a call fails. Owns that peer's
    /// in-flight slot for its whole lifetime.
    async fn replicate_to(self: Arc<Self>, peer_id: u64, mut req: AppendEntriesRequest) {
        loop {
            if req.entries.is_empty() {
                tracing::trace!(node_id = self.id, peer_id, term = req.term, "Sending heartbeat");
            }
            let result = self.peers.append_entries(peer_id, req.clone()).await;
            match self.handle_append_response(peer_id, &req, result).await {
                Some(next) => req = next,
                None => break,
            }
        }
    }

    /// Apply an AppendEntries reply. Returns the follow-up request when the
    /// peer still needs entries; otherwise releases the in-flight slot.
    async fn handle_append_response(
        &self,
        peer_id: u64,
        req: &AppendEntriesRequest,
        result: std::result::Result<AppendEntriesResponse, PeerError>,
    ) -> Option<AppendEntriesRequest> {
        let mut state = self.state.write().await;
        let still_leading = state.role == RaftRole::Leader && state.current_term == req.term;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id, error = %e, "AppendEntries failed");
                if still_leading {
                    release_in_flight(&mut state, peer_id);
                }
                return None;
            }
        };

        if resp.term > state.current_term {
            tracing::info!(
                node_id = self.id,
                peer_id,
                term = resp.term,
                "Higher term seen in AppendEntries reply, stepping down"
            );
            state.become_follower(resp.term);
            state.leader_id = None;
            state.election_deadline = self.timer.next_deadline();
            let _ = state.persist_if_dirty(self.storage.as_ref());
            return None;
        }
        if !still_leading {
            return None;
        }

        let quorum = self.config.quorum();
        let last_log_index = state.last_log_index();
        let leader = state.leader.as_mut()?;

        if resp.success {
            let replicated = req.prev_log_index + req.entries.len() as u64;
            let match_index = leader.match_index.entry(peer_id).or_insert(0);
            if replicated > *match_index {
                *match_index = replicated;
            }
            let matched = *match_index;
            let next_index = leader.next_index.entry(peer_id).or_insert(1);
            if matched + 1 > *next_index {
                *next_index = matched + 1;
            }

            if state.advance_commit_index(quorum) {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.notify_commit(state.commit_index);
            }
        } else {
            // Only react if this reply is for the next_index we still hold;
            // an older rejection has already been acted on.
            let next_index = leader.next_index.entry(peer_id).or_insert(1);
            if *next_index == req.prev_log_index + 1 && *next_index > 1 {
                let backtracked = (*next_index - 1).min(resp.match_index + 1).max(1);
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    from = *next_index,
                    to = backtracked,
                    "Log mismatch, backing off next_index"
                );
                *next_index = backtracked;
            }
        }

        let behind = state
            .leader
            .as_ref()
            .and_then(|l| l.next_index.get(&peer_id))
            .map_or(false, |&next| next <= last_log_index);
        if behind {
            if let Some(next) = self.build_append_request(&state, peer_id) {
                return Some(next);
            }
        }
        release_in_flight(&mut state, peer_id);
        None
    }

    // ---------------------------------------------------------------------
    // Client submissions and applying committed entries
    // ---------------------------------------------------------------------

    /// Handle a request to append a command (leader only)
    async fn handle_append_command(
        self: &Arc<Self>,
        command: Vec<u8>,
        response_tx: oneshot::Sender<Result<Applied>>,
    ) {
        let mut state = self.state.write().await;

        if state.is_down() {
            let _ = response_tx.send(Err(ReplicaError::Down));
            return;
        }
        if state.role != RaftRole::Leader {
            let _ = response_tx.send(Err(ReplicaError::NotLeader(state.leader_id)));
            return;
        }

        let index = state.append_entry(command);
        if let Err(e) = state.persist_if_dirty(self.storage.as_ref()) {
            let _ = response_tx.send(Err(e.into()));
            return;
        }
        let term = state.current_term;
        tracing::debug!(node_id = self.id, index, term, "Appended command to log");

        // Registered under the state lock so the entry cannot be applied
        // before its waiter exists.
        self.pending.lock().await.insert(index, (term, response_tx));

        if state.advance_commit_index(self.config.quorum()) {
            self.notify_commit(state.commit_index);
        }
        drop(state);

        self.broadcast_append_entries().await;
    }

    /// Submit a command through the log and wait for the state machine's
    /// result.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Applied> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(RaftMessage::AppendCommand {
                command,
                response_tx,
            })
            .await
            .map_err(|_| ReplicaError::Down)?;

        match tokio::time::timeout(SUBMIT_TIMEOUT, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplicaError::Down),
            Err(_) => Err(ReplicaError::Timeout("entry to be applied".into())),
        }
    }

    /// Apply committed entries to the state machine whenever the commit
    /// index moves. Runs until `shutdown` is cancelled.
    pub async fn run_applier(self: Arc<Self>, shutdown: CancellationToken) {
        let mut commit_rx = self.subscribe_commits();
        loop {
            self.apply_committed().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Hand every committed-but-unapplied entry to the state machine, in
    /// order, and resolve waiting submitters. Returns how many were applied.
    pub async fn apply_committed(&self) -> usize {
        let entries = self.state.write().await.take_committed_entries();
        let count = entries.len();

        for entry in entries {
            let output = self.state_machine.apply(entry.index, &entry.command);
            let waiter = self.pending.lock().await.remove(&entry.index);
            if let Some((term, tx)) = waiter {
                let outcome = if term == entry.term {
                    Ok(Applied {
                        index: entry.index,
                        output,
                    })
                } else {
                    Err(ReplicaError::EntryOverwritten { index: entry.index })
                };
                let _ = tx.send(outcome);
            }
        }

        if count > 0 {
            tracing::debug!(node_id = self.id, applied = count, "Applied committed entries");
        }
        count
    }

    // ---------------------------------------------------------------------
    // Inbound RPCs
    // ---------------------------------------------------------------------

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.write().await;
        let term_before = state.current_term;
        let response = handle_request_vote(&mut state, &req, self.id, self.storage.as_ref())?;

        if response.vote_granted || state.current_term > term_before {
            state.election_deadline = self.timer.next_deadline();
        }

        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.write().await;
        let commit_before = state.commit_index;
        let response = handle_append_entries(&mut state, &req, self.id, self.storage.as_ref())?;

        // Any request from the current term's leader counts as contact, even
        // when the log check failed.
        if req.term == state.current_term {
            state.election_deadline = self.timer.next_deadline();
        }
        if state.commit_index > commit_before {
            self.notify_commit(state.commit_index);
        }

        Ok(response)
    }

    // ---------------------------------------------------------------------
    // Introspection and administration
    // ---------------------------------------------------------------------

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.read().await;
        NodeStatus {
            node_id: self.id,
            role: state.role,
            term: state.current_term,
            leader_id: if state.role == RaftRole::Leader {
                Some(self.id)
            } else {
                state.leader_id
            },
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
        }
    }

    /// Reachability of each peer as of the last call made to it.
    pub async fn get_peers_status(&self) -> HashMap<u64, bool> {
        self.peers.status().await
    }

    pub async fn peer_addr(&self, peer_id: u64) -> Option<String> {
        self.peers.addr_of(peer_id).await
    }

    /// Stop sending to `peer_id`. Used to simulate network partitions.
    pub async fn disconnect_peer(&self, peer_id: u64) {
        self.peers.disconnect(peer_id).await;
    }

    pub async fn reconnect_peer(&self, peer_id: u64) {
        self.peers.reconnect(peer_id).await;
    }
}

fn release_in_flight(state: &mut RaftState, peer_id: u64) {
    if let Some(leader) = state.leader.as_mut() {
        leader.in_flight.remove(&peer_id);
    }
}
