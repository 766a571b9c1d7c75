use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::{MAX_SLOT_INDEX, SLOT_RESCAN_DELAY},
    SandplaneError, SandplaneResult,
};

use super::{node_short_id, KvStore, Slot};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reserves and releases per-node network slots.
///
/// Reservation is a create-if-absent CAS write against the shared KV store,
/// which makes it safe under concurrent allocators in other processes
/// targeting the same node. The scan is linear because the per-node range is
/// small and contention is low.
pub struct SlotAllocator {
    /// The KV store holding one entry per reserved slot.
    kv: Arc<dyn KvStore>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SlotAllocator {
    /// Creates an allocator over the given KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reserves the lowest free slot on `node_id` for `session_id`.
    ///
    /// Scans indices from 0 upward, attempting a create-if-absent write for
    /// each. When the whole range is taken, sleeps briefly and rescans; there
    /// is no timeout, the caller cancels through `cancel`.
    pub async fn reserve(
        &self,
        node_id: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> SandplaneResult<Slot> {
        let short_id = node_short_id(node_id);

        loop {
            for slot_index in 0..=MAX_SLOT_INDEX {
                if cancel.is_cancelled() {
                    return Err(SandplaneError::Cancelled(format!(
                        "slot reservation for {}",
                        session_id
                    )));
                }

                let key = format!("{}/{}", short_id, slot_index);
                if self.kv.put_cas(&key, session_id.as_bytes(), 0).await? {
                    tracing::debug!(slot_index, session_id, "reserved slot");
                    return Ok(Slot::new(slot_index, node_id, session_id));
                }
            }

            tracing::info!(
                node = %short_id,
                session_id,
                "slot range full, rescanning after back-off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SandplaneError::Cancelled(format!(
                        "slot reservation for {}",
                        session_id
                    )));
                }
                _ = tokio::time::sleep(SLOT_RESCAN_DELAY) => {}
            }
        }
    }

    /// Releases a reserved slot.
    ///
    /// A missing entry, or an entry owned by a different session, means the
    /// slot was already reclaimed; both are logged and treated as success.
    /// Only KV I/O failures surface as errors.
    pub async fn release(&self, slot: &Slot) -> SandplaneResult<()> {
        let key = slot.kv_key();

        let Some(entry) = self.kv.get(&key).await? else {
            tracing::warn!(key, "slot entry already gone, nothing to release");
            return Ok(());
        };

        if entry.value_str() != *slot.get_session_id() {
            tracing::warn!(
                key,
                owner = %entry.value_str(),
                session_id = %slot.get_session_id(),
                "slot reclaimed by a newer owner, leaving entry in place"
            );
            return Ok(());
        }

        if !self
            .kv
            .delete_cas(&key, *entry.get_modify_index())
            .await?
        {
            // Lost a race against a concurrent release or re-reservation.
            tracing::warn!(key, "slot delete lost compare-and-swap, already released");
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::MemoryKvStore;

    fn allocator() -> SlotAllocator {
        SlotAllocator::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_reserve_scans_from_zero() -> SandplaneResult<()> {
        let allocator = allocator();
        let cancel = CancellationToken::new();

        let first = allocator.reserve("node-aaaa-bbbb", "s1", &cancel).await?;
        let second = allocator.reserve("node-aaaa-bbbb", "s2", &cancel).await?;

        assert_eq!(*first.get_slot_index(), 0);
        assert_eq!(*second.get_slot_index(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_frees_index_for_reuse() -> SandplaneResult<()> {
        let allocator = allocator();
        let cancel = CancellationToken::new();

        let slot = allocator.reserve("node-aaaa-bbbb", "s1", &cancel).await?;
        allocator.release(&slot).await?;

        let again = allocator.reserve("node-aaaa-bbbb", "s2", &cancel).await?;
        assert_eq!(*again.get_slot_index(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_is_idempotent() -> SandplaneResult<()> {
        let allocator = allocator();
        let cancel = CancellationToken::new();

        let slot = allocator.reserve("node-aaaa-bbbb", "s1", &cancel).await?;
        allocator.release(&slot).await?;
        allocator.release(&slot).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_reservation() -> SandplaneResult<()> {
        let kv = Arc::new(MemoryKvStore::new());
        let allocator = SlotAllocator::new(kv.clone());
        let cancel = CancellationToken::new();

        let slot = allocator.reserve("node-aaaa-bbbb", "s1", &cancel).await?;
        allocator.release(&slot).await?;

        // Slot 0 now belongs to a different session; the stale handle's
        // release must not disturb it.
        let _reused = allocator.reserve("node-aaaa-bbbb", "s2", &cancel).await?;
        allocator.release(&slot).await?;

        let entry = kv.get("node-aaa/0").await?;
        assert!(entry.is_some(), "newer reservation must survive");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_reserve_returns() {
        let allocator = allocator();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = allocator.reserve("node-aaaa-bbbb", "s1", &cancel).await;
        assert!(matches!(result, Err(SandplaneError::Cancelled(_))));
    }
}
