use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{ReplicaError, Result};
use crate::grpc::GrpcServer;
use crate::raft::node::RaftMessage;
use crate::raft::storage::{FileStorage, MemoryStorage, Storage};
use crate::raft::RaftNode;
use crate::store::KvStore;

/// One replica: consensus core, key-value store, and the gRPC endpoint that
/// serves both.
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub store: Arc<KvStore>,
}

/// Durable storage under `data_dir` when configured, memory otherwise.
pub fn open_storage(config: &NodeConfig) -> Result<Arc<dyn Storage>> {
    match &config.data_dir {
        Some(dir) => {
            let storage = FileStorage::open(dir)?;
            tracing::info!(
                node_id = config.node_id,
                dir = %storage.dir().display(),
                "Using file storage"
            );
            Ok(Arc::new(storage))
        }
        None => {
            tracing::warn!(
                node_id = config.node_id,
                "No data directory configured, Raft state will not survive a restart"
            );
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let storage = open_storage(&config)?;
        Self::with_storage(config, storage)
    }

    pub fn with_storage(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let store = Arc::new(KvStore::new());
        let (raft_node, raft_rx) = RaftNode::new(config.clone(), storage, store.clone())?;

        let node = Self {
            config,
            raft_node: Arc::new(raft_node),
            store,
        };
        Ok((node, raft_rx))
    }

    /// Run the node with all components.
    ///
    /// 1. Starts the gRPC server so peers can reach us
    /// 2. Announces this replica to every peer and waits until every peer has
    ///    announced itself (ReplicaReady)
    /// 3. Spawns the Raft event loop and the applier
    /// 4. Serves until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Fails if the server cannot start or the startup handshake does not
    /// complete within the configured startup timeout.
    pub async fn run(
        self,
        raft_rx: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let server = GrpcServer::new(
            self.config.listen_addr,
            self.raft_node.clone(),
            self.store.clone(),
        );
        let server_shutdown = shutdown.clone();
        let serve = server.run_with_shutdown(async move { server_shutdown.cancelled().await });
        tokio::pin!(serve);

        tokio::select! {
            result = self.raft_node.complete_handshake() => {
                if let Err(e) = result {
                    tracing::error!(node_id = self.config.node_id, error = %e, "Startup handshake failed");
                    shutdown.cancel();
                    let _ = serve.await;
                    return Err(e);
                }
                tracing::info!(node_id = self.config.node_id, "All peers ready");
            }
            served = &mut serve => {
                return served.map_err(ReplicaError::from);
            }
            _ = shutdown.cancelled() => {
                let _ = serve.await;
                return Ok(());
            }
        }

        let raft_node = self.raft_node.clone();
        let raft_shutdown = shutdown.clone();
        let raft_handle = tokio::spawn(async move {
            raft_node.run(raft_rx, raft_shutdown).await;
        });

        let applier = self.raft_node.clone();
        let applier_shutdown = shutdown.clone();
        tokio::spawn(async move {
            applier.run_applier(applier_shutdown).await;
        });

        let served = serve.await;
        // The server only stops on shutdown or failure; either way the
        // replica is finished.
        shutdown.cancel();
        let _ = raft_handle.await;

        served.map_err(ReplicaError::from)
    }
}
