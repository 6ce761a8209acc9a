use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::proto::consensus_service_server::ConsensusService;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, ReplicaReadyRequest, ReplicaReadyResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;

/// gRPC service for replica-to-replica consensus traffic
pub struct ClusterService {
    raft_node: Arc<RaftNode>,
}

impl ClusterService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl ConsensusService for ClusterService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.raft_node.handle_vote_request(req).await?;
        Ok(Response::new(response))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let is_heartbeat = req.entries.is_empty();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat,
            "Received AppendEntries"
        );

        let response = self.raft_node.handle_append_entries(req).await?;
        Ok(Response::new(response))
    }

    async fn replica_ready(
        &self,
        request: Request<ReplicaReadyRequest>,
    ) -> Result<Response<ReplicaReadyResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            replica_id = req.replica_id,
            want_reply = req.want_reply,
            "Received ReplicaReady"
        );

        if !self.raft_node.config().peer_ids().contains(&req.replica_id) {
            return Err(Status::invalid_argument(format!(
                "Unknown replica {}",
                req.replica_id
            )));
        }

        self.raft_node
            .handle_replica_ready(req.replica_id, req.want_reply)
            .await;
        Ok(Response::new(ReplicaReadyResponse {
            replica_id: self.raft_node.id,
        }))
    }
}
