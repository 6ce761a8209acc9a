use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tonic::transport::{Channel, Endpoint};

use crate::config::PeerConfig;
use crate::error::{ReplicaError, Result};
use crate::proto::consensus_service_client::ConsensusServiceClient;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, ReplicaReadyRequest, VoteRequest, VoteResponse,
};

const HANDSHAKE_BACKOFF_MIN: Duration = Duration::from_millis(50);
const HANDSHAKE_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Failure of a single outbound call. Never fatal: the caller leaves that
/// peer's progress alone and tries again on the next tick.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer {0} is unknown")]
    Unknown(u64),

    #[error("peer {0} is unreachable")]
    Unreachable(u64),

    #[error("call to peer {0} timed out")]
    Timeout(u64),

    #[error("call to peer {peer_id} failed: {status}")]
    Rpc {
        peer_id: u64,
        status: tonic::Status,
    },
}

type CallResult<T> = std::result::Result<T, PeerError>;

struct Peer {
    addr: String,
    client: Option<ConsensusServiceClient<Channel>>,
    reachable: bool,
    /// Administratively cut off; calls fail without touching the network.
    partitioned: bool,
}

/// Outbound call handles for every other replica, plus what we last learned
/// about whether each one answers.
pub struct PeerSet {
    my_id: u64,
    rpc_timeout: Duration,
    peers: RwLock<HashMap<u64, Peer>>,
}

impl PeerSet {
    pub fn new(my_id: u64, peers: &[PeerConfig], rpc_timeout: Duration) -> Self {
        let peers = peers
            .iter()
            .map(|p| {
                (
                    p.node_id,
                    Peer {
                        addr: p.addr.clone(),
                        client: None,
                        reachable: false,
                        partitioned: false,
                    },
                )
            })
            .collect();
        Self {
            my_id,
            rpc_timeout,
            peers: RwLock::new(peers),
        }
    }

    pub async fn peer_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.peers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn addr_of(&self, peer_id: u64) -> Option<String> {
        self.peers.read().await.get(&peer_id).map(|p| p.addr.clone())
    }

    /// Reachability of every peer as of its most recent call.
    pub async fn status(&self) -> HashMap<u64, bool> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, p)| (*id, p.reachable && !p.partitioned))
            .collect()
    }

    /// Cut this node off from `peer_id` (outbound only).
    pub async fn disconnect(&self, peer_id: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
            peer.partitioned = true;
            peer.reachable = false;
            tracing::info!(node_id = self.my_id, peer_id, "Peer disconnected");
        }
    }

    pub async fn reconnect(&self, peer_id: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
            peer.partitioned = false;
            tracing::info!(node_id = self.my_id, peer_id, "Peer reconnected");
        }
    }

    /// Clone of the call handle for `peer_id`, creating the channel on first
    /// use. The channel connects lazily, so this does not touch the network.
    async fn client(&self, peer_id: u64) -> CallResult<ConsensusServiceClient<Channel>> {
        {
            let peers = self.peers.read().await;
            let peer = peers.get(&peer_id).ok_or(PeerError::Unknown(peer_id))?;
            if peer.partitioned {
                return Err(PeerError::Unreachable(peer_id));
            }
            if let Some(client) = &peer.client {
                return Ok(client.clone());
            }
        }

        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(&peer_id).ok_or(PeerError::Unknown(peer_id))?;
        if let Some(client) = &peer.client {
            return Ok(client.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", peer.addr))
            .map_err(|_| PeerError::Unreachable(peer_id))?
            .connect_timeout(self.rpc_timeout)
            .timeout(self.rpc_timeout);
        let client = ConsensusServiceClient::new(endpoint.connect_lazy());
        peer.client = Some(client.clone());
        Ok(client)
    }

    async fn set_reachable(&self, peer_id: u64, reachable: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
            if peer.reachable != reachable {
                tracing::debug!(
                    node_id = self.my_id,
                    peer_id,
                    reachable,
                    "Peer reachability changed"
                );
            }
            peer.reachable = reachable && !peer.partitioned;
        }
    }

    async fn finish<T>(
        &self,
        peer_id: u64,
        result: std::result::Result<
            std::result::Result<tonic::Response<T>, tonic::Status>,
            tokio::time::error::Elapsed,
        >,
    ) -> CallResult<T> {
        match result {
            Ok(Ok(response)) => {
                self.set_reachable(peer_id, true).await;
                Ok(response.into_inner())
            }
            Ok(Err(status)) => {
                self.set_reachable(peer_id, false).await;
                Err(PeerError::Rpc { peer_id, status })
            }
            Err(_) => {
                self.set_reachable(peer_id, false).await;
                Err(PeerError::Timeout(peer_id))
            }
        }
    }

    pub async fn request_vote(
        &self,
        peer_id: u64,
        req: VoteRequest,
    ) -> CallResult<VoteResponse> {
        let mut client = self.client(peer_id).await?;
        let result = timeout(self.rpc_timeout, client.request_vote(req)).await;
        self.finish(peer_id, result).await
    }

    pub async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> CallResult<AppendEntriesResponse> {
        let mut client = self.client(peer_id).await?;
        let result = timeout(self.rpc_timeout, client.append_entries(req)).await;
        self.finish(peer_id, result).await
    }

    /// Send one ReplicaReady notification to `peer_id`.
    pub async fn announce_to(&self, peer_id: u64, want_reply: bool) -> CallResult<()> {
        let mut client = self.client(peer_id).await?;
        let req = ReplicaReadyRequest {
            replica_id: self.my_id,
            want_reply,
        };
        let result = timeout(self.rpc_timeout, client.replica_ready(req)).await;
        self.finish(peer_id, result).await.map(|_| ())
    }

    /// Dial every peer and tell it we are connected, retrying each one with
    /// backoff until `limit` elapses. Peers are contacted in parallel.
    pub async fn announce_to_all(self: &std::sync::Arc<Self>, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        let mut tasks = JoinSet::new();

        for peer_id in self.peer_ids().await {
            let peers = self.clone();
            tasks.spawn(async move {
                let mut backoff = HANDSHAKE_BACKOFF_MIN;
                loop {
                    match peers.announce_to(peer_id, true).await {
                        Ok(()) => {
                            tracing::info!(node_id = peers.my_id, peer_id, "Connected to peer");
                            return Ok(());
                        }
                        Err(e) => {
                            if Instant::now() + backoff >= deadline {
                                return Err((peer_id, e));
                            }
                            tracing::debug!(peer_id, error = %e, "Peer not ready yet, retrying");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(HANDSHAKE_BACKOFF_MAX);
                        }
                    }
                }
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((peer_id, e))) => {
                    tracing::warn!(peer_id, error = %e, "Failed to reach peer during startup");
                    failures.push(peer_id);
                }
                Err(e) => return Err(ReplicaError::Internal(e.to_string())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_unstable();
            Err(ReplicaError::Handshake(format!(
                "peers {:?} never answered ReplicaReady",
                failures
            )))
        }
    }
}
