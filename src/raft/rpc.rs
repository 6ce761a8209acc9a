use crate::error::{ReplicaError, Result};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry as ProtoLogEntry, VoteRequest,
    VoteResponse,
};
use crate::raft::log::LogEntry;
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::storage::Storage;

/// Handle RequestVote RPC
///
/// The reply is built only after any change to term or vote is durable.
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    my_id: u64,
    storage: &dyn Storage,
) -> Result<VoteResponse> {
    if state.is_down() {
        return Err(ReplicaError::Down);
    }

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state
        .log
        .is_up_to_date(req.last_log_index, req.last_log_term)
    {
        false
    } else {
        state.record_vote(req.candidate_id);
        true
    };

    state.persist_if_dirty(storage)?;

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(VoteResponse {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
    storage: &dyn Storage,
) -> Result<AppendEntriesResponse> {
    if state.is_down() {
        return Err(ReplicaError::Down);
    }

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: 0,
        });
    }

    // Valid leader for this term: adopt the term and step down if needed
    if req.term > state.current_term || state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    if !state.log.matches(req.prev_log_index, req.prev_log_term) {
        let hint = state.log.conflict_hint(req.prev_log_index);
        state.persist_if_dirty(storage)?;
        tracing::debug!(
            node_id = my_id,
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            hint,
            "AppendEntries log mismatch"
        );
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: hint,
        });
    }

    let entry_count = req.entries.len() as u64;
    if !req.entries.is_empty() {
        let incoming: Vec<LogEntry> = req.entries.iter().map(proto_to_log_entry).collect();
        if state.log.merge(req.prev_log_index, incoming) {
            state.mark_dirty();
            tracing::debug!(
                node_id = my_id,
                entries = entry_count,
                new_last_index = state.last_log_index(),
                "Appended entries"
            );
        }
    }

    state.persist_if_dirty(storage)?;

    // Only positions verified against this leader may be committed.
    let match_index = req.prev_log_index + entry_count;
    if state.set_commit_index(req.leader_commit.min(match_index)) {
        tracing::debug!(
            node_id = my_id,
            commit_index = state.commit_index,
            "Follower commit index advanced"
        );
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index,
    })
}

/// Convert protobuf LogEntry to internal LogEntry
pub fn proto_to_log_entry(proto: &ProtoLogEntry) -> LogEntry {
    LogEntry {
        term: proto.term,
        index: proto.index,
        command: proto.command.clone(),
    }
}

/// Convert internal LogEntry to protobuf LogEntry
pub fn log_entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        command: entry.command.clone(),
    }
}
