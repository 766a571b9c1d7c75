//! End-to-end tests of the cache → eviction → teardown pipeline, with a
//! recording teardown standing in for the network/VM stack.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use sandplane::{
    analytics::AnalyticsClient,
    cache::{
        Eviction, EvictionDispatcher, EvictionReason, SessionCache, SessionRecord, SessionTeardown,
    },
    runtime::VmHandle,
    slot::Slot,
    SandplaneError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Records every eviction it is asked to tear down.
#[derive(Default)]
struct RecordingTeardown {
    seen: Mutex<Vec<(String, EvictionReason)>>,
}

#[async_trait]
impl SessionTeardown for RecordingTeardown {
    async fn teardown(&self, eviction: Eviction) {
        let _ = eviction.record.get_handle().shutdown().await;
        self.seen.lock().unwrap().push((
            eviction.record.get_sandbox_id().clone(),
            eviction.reason,
        ));
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn record(sandbox_id: &str, team_id: Option<&str>) -> SessionRecord {
    let child = Command::new("sleep").arg("60").spawn().unwrap();
    let pid = child.id().unwrap();
    let handle = VmHandle::new(
        format!("task-{sandbox_id}"),
        sandbox_id,
        pid,
        child,
        "/tmp/api.sock",
        "ns-0",
    );

    SessionRecord::builder()
        .sandbox_id(sandbox_id.to_string())
        .client_id("node-abc".to_string())
        .template_id("tmpl".to_string())
        .team_id(team_id.map(str::to_string))
        .build_id("b1".to_string())
        .max_instance_length(Duration::from_secs(3600))
        .handle(handle)
        .slot(Slot::new(0, "node-abcdefgh", sandbox_id))
        .build()
}

async fn wait_for_teardowns(teardown: &RecordingTeardown, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while teardown.seen.lock().unwrap().len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "teardowns never arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_expiry_runs_teardown_pipeline() {
    let (cache, evict_rx) = SessionCache::new(Duration::from_secs(60), AnalyticsClient::disabled());
    let teardown = Arc::new(RecordingTeardown::default());
    let _dispatcher = EvictionDispatcher::spawn(evict_rx, teardown.clone());
    let expiry = cache.spawn_expiry();

    cache
        .add(record("sb-expiring", None), Duration::from_millis(50))
        .unwrap();

    wait_for_teardowns(&teardown, 1).await;

    let seen = teardown.seen.lock().unwrap().clone();
    assert_eq!(seen[0].0, "sb-expiring");
    assert_eq!(seen[0].1, EvictionReason::Expired);
    assert!(cache.get("sb-expiring").is_none());

    expiry.abort();
}

#[test_log::test(tokio::test)]
async fn test_delete_runs_teardown_pipeline() {
    let (cache, evict_rx) = SessionCache::new(Duration::from_secs(60), AnalyticsClient::disabled());
    let teardown = Arc::new(RecordingTeardown::default());
    let _dispatcher = EvictionDispatcher::spawn(evict_rx, teardown.clone());

    cache
        .add(record("sb-doomed", None), Duration::from_secs(60))
        .unwrap();
    cache.kill("sb-doomed").unwrap();

    wait_for_teardowns(&teardown, 1).await;

    let seen = teardown.seen.lock().unwrap().clone();
    assert_eq!(seen[0], ("sb-doomed".to_string(), EvictionReason::Deleted));
}

#[test_log::test(tokio::test)]
async fn test_sync_purges_and_inserts() {
    let (cache, evict_rx) = SessionCache::new(Duration::from_secs(60), AnalyticsClient::disabled());
    let teardown = Arc::new(RecordingTeardown::default());
    let _dispatcher = EvictionDispatcher::spawn(evict_rx, teardown.clone());

    let a = record("sb-a", None);
    let b = record("sb-b", None);
    let c = record("sb-c", None);
    let d = record("sb-d", None);

    cache.add(a, Duration::from_secs(60)).unwrap();
    cache.add(b.clone(), Duration::from_secs(60)).unwrap();
    cache.add(c, Duration::from_secs(60)).unwrap();

    cache.sync(vec![b, d]);

    wait_for_teardowns(&teardown, 2).await;

    let mut purged: Vec<String> = teardown
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(id, reason)| {
            assert_eq!(*reason, EvictionReason::Synced);
            id.clone()
        })
        .collect();
    purged.sort();
    assert_eq!(purged, vec!["sb-a".to_string(), "sb-c".to_string()]);

    let mut live: Vec<String> = cache
        .list(None)
        .into_iter()
        .map(|r| r.get_sandbox_id().clone())
        .collect();
    live.sort();
    assert_eq!(live, vec!["sb-b".to_string(), "sb-d".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_creates_respect_team_limit() {
    let (cache, _evict_rx) =
        SessionCache::new(Duration::from_secs(60), AnalyticsClient::disabled());

    let mut tasks = Vec::new();
    for i in 0..3 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let sandbox_id = format!("sb-{i}");
            let reservation = cache.reserve(&sandbox_id, Some("team-x"), 2)?;
            // Simulate the build window between admission and registration.
            tokio::time::sleep(Duration::from_millis(50)).await;
            cache.add(record(&sandbox_id, Some("team-x")), Duration::from_secs(60))?;
            drop(reservation);
            Ok::<_, SandplaneError>(())
        }));
    }

    let mut ok = 0;
    let mut limited = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => ok += 1,
            Err(SandplaneError::TeamLimitExceeded { .. }) => limited += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(ok, 2, "exactly two creates must be admitted");
    assert_eq!(limited, 1, "exactly one create must hit the limit");
    assert_eq!(cache.count_for_team("team-x"), 2);
}
