use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::proto::kv_service_server::KvService;
use crate::proto::{
    DeleteRequest, DeleteResponse, GetRequest, GetResponse, GetStatusRequest, GetStatusResponse,
    PeerStatus, PutRequest, PutResponse,
};
use crate::raft::RaftNode;
use crate::store::{KvCommand, KvOutcome, KvStore};

/// gRPC service for the client-facing key-value API
pub struct ClientService {
    raft_node: Arc<RaftNode>,
    store: Arc<KvStore>,
}

impl ClientService {
    pub fn new(raft_node: Arc<RaftNode>, store: Arc<KvStore>) -> Self {
        Self { raft_node, store }
    }

    /// Reject early with a redirect hint when this replica cannot accept
    /// writes.
    async fn require_leader(&self) -> Result<(), Status> {
        if self.raft_node.is_leader().await {
            return Ok(());
        }
        let message = match self.raft_node.get_leader_id().await {
            Some(id) => format!("Not the leader. Redirect to node {}", id),
            None => "Not the leader. Leader unknown, retry later".to_string(),
        };
        Err(Status::failed_precondition(message))
    }

    /// Replicate `command` and decode the store's result. Returns the log
    /// index the command was applied at alongside it.
    async fn replicate(&self, command: KvCommand) -> Result<(u64, KvOutcome), Status> {
        self.require_leader().await?;

        let bytes = command
            .encode()
            .map_err(|e| Status::internal(format!("Failed to encode command: {}", e)))?;
        let applied = self.raft_node.submit(bytes).await?;

        let outcome = KvOutcome::decode(&applied.output)
            .map_err(|e| Status::internal(format!("Failed to decode result: {}", e)))?;
        if let Some(error) = outcome.error {
            return Err(Status::internal(error));
        }
        Ok((applied.index, outcome))
    }
}

#[tonic::async_trait]
impl KvService for ClientService {
    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("Key cannot be empty"));
        }

        let key = req.key.clone();
        let (index, outcome) = self
            .replicate(KvCommand::Put {
                key: req.key,
                value: req.value,
            })
            .await?;

        tracing::info!(key = %key, index, "Put committed");
        Ok(Response::new(PutResponse {
            index,
            previous: outcome.previous.unwrap_or_default(),
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        self.require_leader().await?;

        let response = match self.store.get(&req.key) {
            Some(value) => GetResponse { found: true, value },
            None => GetResponse {
                found: false,
                value: String::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("Key cannot be empty"));
        }

        let key = req.key.clone();
        let (index, outcome) = self.replicate(KvCommand::Delete { key: req.key }).await?;

        tracing::info!(key = %key, index, "Delete committed");
        Ok(Response::new(DeleteResponse {
            index,
            existed: outcome.previous.is_some(),
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let status = self.raft_node.status().await;
        let peers_status = self.raft_node.get_peers_status().await;

        let mut peers = Vec::with_capacity(peers_status.len());
        for (node_id, reachable) in peers_status {
            peers.push(PeerStatus {
                node_id,
                addr: self.raft_node.peer_addr(node_id).await.unwrap_or_default(),
                reachable,
            });
        }
        // Sort by node_id for consistent ordering
        peers.sort_by_key(|p| p.node_id);

        Ok(Response::new(GetStatusResponse {
            node_id: status.node_id,
            role: status.role.to_string(),
            term: status.term,
            leader_id: status.leader_id.unwrap_or(0),
            has_leader: status.leader_id.is_some(),
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            last_log_index: status.last_log_index,
            peers,
        }))
    }
}
