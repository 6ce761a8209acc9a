use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{ReplicaError, Result};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Deadline applied to every outbound RequestVote/AppendEntries call.
    pub rpc_timeout_ms: u64,
    /// How long to wait for every peer to complete the ReplicaReady handshake.
    pub startup_timeout_ms: u64,
    /// Directory for term/vote/log. `None` keeps state in memory only.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            startup_timeout_ms: 30_000,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Total number of replicas in the cluster, including this one.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Number of replicas (including self) that form a majority.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    /// Reject configurations that would make elections unstable or the
    /// replica set ambiguous.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(ReplicaError::Config(format!(
                "election timeout range {}..={}ms is invalid",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ReplicaError::Config(format!(
                "heartbeat interval {}ms must be positive and below the election timeout minimum {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ReplicaError::Config("rpc timeout must be positive".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(ReplicaError::Config(format!(
                    "peer list contains this node's own id {}",
                    self.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(ReplicaError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}

/// Parse a peer list of the form `"2:127.0.0.1:50052,3:127.0.0.1:50053"`.
pub fn parse_peers(peers: &str) -> Result<Vec<PeerConfig>> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, addr) = entry.split_once(':').ok_or_else(|| {
                ReplicaError::Config(format!("peer '{}' is not in id:host:port form", entry))
            })?;
            let node_id = id
                .parse::<u64>()
                .map_err(|_| ReplicaError::Config(format!("invalid peer id '{}'", id)))?;
            if !addr.contains(':') {
                return Err(ReplicaError::Config(format!(
                    "peer address '{}' is missing a port",
                    addr
                )));
            }
            Ok(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}
