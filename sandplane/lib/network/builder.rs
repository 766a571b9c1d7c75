use std::sync::Arc;

use crate::{
    slot::{Slot, SlotAllocator},
    SandplaneResult,
};

use super::{HostsFile, NetnsWorker};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builds and removes the per-sandbox network environment.
///
/// The builder owns the ordering between the namespace worker, the shared
/// hosts file, and the slot allocator: creation runs topology → hosts entry,
/// removal runs hosts entry → topology → slot release. A failed creation is
/// fully removed before the error surfaces, so a caller holding a reserved
/// slot never has to guess how far setup got.
pub struct NetworkBuilder {
    /// The namespace worker thread.
    worker: Arc<NetnsWorker>,

    /// The shared hosts file writer.
    hosts: Arc<HostsFile>,

    /// The slot allocator, released as the final removal step.
    allocator: Arc<SlotAllocator>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkBuilder {
    /// Creates a builder over the given worker, hosts file, and allocator.
    pub fn new(
        worker: Arc<NetnsWorker>,
        hosts: Arc<HostsFile>,
        allocator: Arc<SlotAllocator>,
    ) -> Self {
        Self {
            worker,
            hosts,
            allocator,
        }
    }

    /// Builds the network environment for `slot`, finishing with the hosts
    /// file entry mapping the sandbox's host-visible address to its id.
    ///
    /// On failure the whole environment, slot reservation included, is
    /// removed before the error is returned.
    pub async fn create(&self, slot: &Slot, sandbox_id: &str) -> SandplaneResult<()> {
        if let Err(e) = self.worker.create_topology(slot).await {
            tracing::error!(
                sandbox_id,
                slot_index = slot.get_slot_index(),
                error = %e,
                "network topology creation failed, rolling back"
            );
            self.remove_after_failed_create(slot, sandbox_id).await;
            return Err(e);
        }

        if let Err(e) = self.hosts.add(slot.host_ip_cidr().ip(), sandbox_id).await {
            tracing::error!(sandbox_id, error = %e, "hosts file update failed, rolling back");
            self.remove_after_failed_create(slot, sandbox_id).await;
            return Err(e);
        }

        Ok(())
    }

    /// Removes the network environment for `slot` and releases the slot.
    ///
    /// Individual steps are best-effort; only a slot release failure (a KV
    /// I/O error) is surfaced.
    pub async fn remove(&self, slot: &Slot, sandbox_id: &str) -> SandplaneResult<()> {
        if let Err(e) = self.hosts.remove(sandbox_id).await {
            tracing::warn!(sandbox_id, error = %e, "failed to remove hosts file entry");
        }

        if let Err(e) = self.worker.remove_topology(slot).await {
            tracing::warn!(sandbox_id, error = %e, "failed to remove network topology");
        }

        self.allocator.release(slot).await
    }

    async fn remove_after_failed_create(&self, slot: &Slot, sandbox_id: &str) {
        if let Err(e) = self.remove(slot, sandbox_id).await {
            tracing::warn!(
                sandbox_id,
                error = %e,
                "rollback of failed network creation left the slot reserved"
            );
        }
    }
}
