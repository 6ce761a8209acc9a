use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::consensus_service_server::ConsensusServiceServer;
use crate::proto::kv_service_server::KvServiceServer;
use crate::raft::RaftNode;
use crate::store::KvStore;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
    store: Arc<KvStore>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft_node: Arc<RaftNode>, store: Arc<KvStore>) -> Self {
        Self {
            addr,
            raft_node,
            store,
        }
    }

    /// Serve both the consensus and the client API on one listener until
    /// `signal` resolves.
    pub async fn run_with_shutdown<F>(self, signal: F) -> Result<(), tonic::transport::Error>
    where
        F: Future<Output = ()>,
    {
        let cluster_service = ClusterService::new(self.raft_node.clone());
        let client_service = ClientService::new(self.raft_node.clone(), self.store.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(ConsensusServiceServer::new(cluster_service))
            .add_service(KvServiceServer::new(client_service))
            .serve_with_shutdown(self.addr, signal)
            .await
    }
}
