pub mod log;
pub mod node;
pub mod peers;
pub mod ready;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use log::{LogEntry, RaftLog};
pub use node::{Applied, NodeStatus, RaftMessage, RaftNode};
pub use state::{RaftRole, RaftState};
pub use storage::{FileStorage, MemoryStorage, PersistentState, Storage, StorageError};
