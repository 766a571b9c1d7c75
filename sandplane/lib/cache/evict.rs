use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};

use super::SessionRecord;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Why a session left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The renewable deadline or absolute cap passed.
    Expired,

    /// The sandbox was explicitly deleted.
    Deleted,

    /// The record was not in the authoritative list during a sync.
    Synced,
}

/// An evicted session on its way to teardown.
#[derive(Debug, Clone)]
pub struct Eviction {
    /// The evicted record.
    pub record: SessionRecord,

    /// Why it was evicted.
    pub reason: EvictionReason,
}

/// The teardown pipeline invoked for every eviction.
///
/// Implementations must be idempotent: an eviction may race a concurrent
/// teardown of the same sandbox (a VM exit racing a delete, a sync racing an
/// expiry) and both may observe the same record.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    /// Tears down everything the record owns. Must not return an error;
    /// failures are logged inside.
    async fn teardown(&self, eviction: Eviction);
}

/// Drains the eviction channel on a background task and runs teardown.
///
/// Keeping teardown off the cache's critical path means slow operations
/// (signalling a stuck VM, KV round-trips) never delay cache mutations.
pub struct EvictionDispatcher {
    task: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EvictionDispatcher {
    /// Spawns the dispatcher over an eviction channel.
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<Eviction>,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Self {
        let task = tokio::spawn(async move {
            while let Some(eviction) = rx.recv().await {
                tracing::info!(
                    sandbox_id = %eviction.record.get_sandbox_id(),
                    reason = ?eviction.reason,
                    "dispatching session teardown"
                );
                teardown.teardown(eviction).await;
            }
        });

        Self { task }
    }

    /// Stops the dispatcher once the channel's senders are gone and all
    /// queued evictions have been processed.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "eviction dispatcher ended abnormally");
        }
    }

    /// Aborts the dispatcher without draining.
    pub fn abort(&self) {
        self.task.abort();
    }
}
