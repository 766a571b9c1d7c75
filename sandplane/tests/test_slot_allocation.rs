//! Concurrency tests for slot reservation against the CAS KV store.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use sandplane::slot::{KvStore, MemoryKvStore, SlotAllocator};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_reserves_yield_unique_slots() {
    let kv = Arc::new(MemoryKvStore::new());
    let allocator = Arc::new(SlotAllocator::new(kv.clone()));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for i in 0..50 {
        let allocator = allocator.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            allocator
                .reserve("node-1234abcd", &format!("session-{i}"), &cancel)
                .await
                .expect("reserve succeeds")
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let slot = handle.await.unwrap();

        // No duplicate indices across concurrent reserves.
        assert!(
            seen.insert(*slot.get_slot_index()),
            "slot {} reserved twice",
            slot.get_slot_index()
        );

        // The KV entry's value is the owner's session id.
        let entry = kv
            .get(&slot.kv_key())
            .await
            .unwrap()
            .expect("reserved entry exists");
        assert_eq!(entry.value_str(), *slot.get_session_id());
    }
}

#[tokio::test]
async fn test_exhausted_node_blocks_until_release() {
    let kv = Arc::new(MemoryKvStore::new());
    let allocator = Arc::new(SlotAllocator::new(kv));
    let cancel = CancellationToken::new();

    let mut reserved = Vec::new();
    for i in 0..=255u16 {
        let slot = allocator
            .reserve("node-1234abcd", &format!("session-{i}"), &cancel)
            .await
            .unwrap();
        reserved.push(slot);
    }

    // The full range is taken: the next reserve must not return promptly.
    let blocked_allocator = allocator.clone();
    let blocked_cancel = cancel.clone();
    let mut blocked = tokio::spawn(async move {
        blocked_allocator
            .reserve("node-1234abcd", "session-late", &blocked_cancel)
            .await
    });

    let early = tokio::time::timeout(Duration::from_secs(1), &mut blocked).await;
    assert!(early.is_err(), "reserve on a full node must keep waiting");

    // Freeing one slot lets the waiter claim exactly that index.
    allocator.release(&reserved[42]).await.unwrap();

    let slot = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("reserve resumed after release")
        .expect("task completed")
        .expect("reserve succeeded");
    assert_eq!(*slot.get_slot_index(), 42);
    assert_eq!(*slot.get_session_id(), "session-late");
}
