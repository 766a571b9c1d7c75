use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    cache::{Eviction, SessionTeardown},
    network::NetworkBuilder,
    runtime::TaskStore,
    vm::VmLauncher,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The teardown pipeline bound to cache evictions.
///
/// Walks back up the creation stack: VM shutdown, network removal (which
/// releases the slot), scratch cleanup, task deregistration. Every step is
/// idempotent, because an eviction may race a concurrent teardown of the
/// same sandbox.
pub struct TeardownPipeline {
    /// Network environment remover.
    network: Arc<NetworkBuilder>,

    /// On-disk sandbox state remover.
    launcher: Arc<VmLauncher>,

    /// Task registry to deregister from.
    tasks: Arc<TaskStore>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TeardownPipeline {
    /// Creates the pipeline over the shared components.
    pub fn new(
        network: Arc<NetworkBuilder>,
        launcher: Arc<VmLauncher>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        Self {
            network,
            launcher,
            tasks,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SessionTeardown for TeardownPipeline {
    async fn teardown(&self, eviction: Eviction) {
        let record = &eviction.record;
        let sandbox_id = record.get_sandbox_id();

        if let Err(e) = record.get_handle().shutdown().await {
            tracing::warn!(sandbox_id, error = %e, "VM shutdown failed during teardown");
        }

        if let Err(e) = self.network.remove(record.get_slot(), sandbox_id).await {
            tracing::warn!(sandbox_id, error = %e, "network removal failed during teardown");
        }

        self.launcher
            .cleanup(record.get_template_id(), sandbox_id)
            .await;

        self.tasks.remove(record.get_handle().task_id()).await;

        tracing::info!(sandbox_id, reason = ?eviction.reason, "session torn down");
    }
}
