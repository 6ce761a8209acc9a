use thiserror::Error;

use crate::raft::storage::StorageError;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Replica is down")]
    Down,

    #[error("Entry at index {index} was overwritten by a newer leader")]
    EntryOverwritten { index: u64 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Startup handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ReplicaError> for tonic::Status {
    fn from(err: ReplicaError) -> Self {
        match err {
            ReplicaError::NotLeader(_) => tonic::Status::failed_precondition(err.to_string()),
            ReplicaError::Down | ReplicaError::Storage(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            ReplicaError::EntryOverwritten { .. } => tonic::Status::aborted(err.to_string()),
            ReplicaError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            ReplicaError::Config(_) => tonic::Status::invalid_argument(err.to_string()),
            ReplicaError::GrpcError(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
