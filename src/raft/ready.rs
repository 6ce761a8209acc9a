use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::error::{ReplicaError, Result};

/// One-time startup barrier.
///
/// Every peer calls `ReplicaReady` on us once it has dialed our server. When
/// all `n_replicas - 1` peers have done so the barrier opens, exactly once,
/// and stays open. Until then the Raft event loop does not start, so no
/// election can begin while part of the cluster is still unreachable.
pub struct ReadyBarrier {
    expected: usize,
    replicas_ready: Mutex<HashSet<u64>>,
    opened_tx: watch::Sender<bool>,
}

impl ReadyBarrier {
    /// `expected` is the number of peers (cluster size minus one). A
    /// barrier expecting nobody is open from the start.
    pub fn new(expected: usize) -> Self {
        let (opened_tx, _) = watch::channel(expected == 0);
        Self {
            expected,
            replicas_ready: Mutex::new(HashSet::new()),
            opened_tx,
        }
    }

    /// Record a ReplicaReady notification from `replica_id`. Repeated
    /// notifications from the same replica count once. Returns true if this
    /// call opened the barrier.
    pub async fn notify(&self, replica_id: u64) -> bool {
        let mut ready = self.replicas_ready.lock().await;
        if !ready.insert(replica_id) {
            tracing::debug!(replica_id, "Duplicate ReplicaReady notification");
            return false;
        }

        tracing::info!(
            replica_id,
            ready = ready.len(),
            expected = self.expected,
            "Received ReplicaReady notification"
        );

        if ready.len() >= self.expected && !*self.opened_tx.borrow() {
            self.opened_tx.send_replace(true);
            tracing::info!("All replicas have connected");
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        *self.opened_tx.borrow()
    }

    pub async fn ready_count(&self) -> usize {
        self.replicas_ready.lock().await.len()
    }

    /// Wait until the barrier opens.
    pub async fn wait(&self) {
        let mut rx = self.opened_tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until the barrier opens, failing after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let ready = self.ready_count().await;
                Err(ReplicaError::Handshake(format!(
                    "only {} of {} peers signalled ReplicaReady within {:?}",
                    ready, self.expected, limit
                )))
            }
        }
    }
}
