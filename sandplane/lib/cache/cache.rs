use std::{
    cmp,
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::{
    analytics::{AnalyticsClient, AnalyticsEvent},
    SandplaneError, SandplaneResult,
};

use super::{Eviction, EvictionReason, SessionRecord};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The TTL session cache: sandbox id → live session, with deadline-ordered
/// expiry, team quota reservations, and sync against an authoritative list.
///
/// All mutations are linearizable with respect to each other: one internal
/// mutex guards the id index, the deadline index, and the reservations map
/// together. Nothing slow happens under the mutex — evictions are handed to a
/// channel and torn down elsewhere.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct SessionCache {
    /// Shared indexes.
    inner: Arc<Mutex<CacheInner>>,

    /// Eviction hand-off to the dispatcher.
    evict_tx: mpsc::UnboundedSender<Eviction>,

    /// Wakes the expiry task when the earliest deadline may have changed.
    notify: Arc<Notify>,

    /// Deadline for sessions inserted by `sync`.
    default_ttl: Duration,

    /// Lifecycle event sink.
    analytics: AnalyticsClient,
}

struct CacheInner {
    /// Session records by sandbox id.
    by_id: HashMap<String, CachedSession>,

    /// Deadline-ordered index for O(log n) expiry.
    by_deadline: BTreeSet<(DateTime<Utc>, String)>,

    /// Quota placeholders by sandbox id.
    reservations: HashMap<String, ReservationEntry>,

    /// Monotonic token distinguishing reservation generations.
    next_reservation_token: u64,
}

struct CachedSession {
    record: SessionRecord,
    deadline: DateTime<Utc>,
}

struct ReservationEntry {
    team_id: Option<String>,
    token: u64,
}

/// A held quota reservation.
///
/// Created by [`SessionCache::reserve`]; released explicitly via
/// [`Reservation::release`], implicitly by a successful `add` with the same
/// sandbox id, or as a backstop when the guard is dropped.
pub struct Reservation {
    cache: SessionCache,
    sandbox_id: String,
    token: u64,
    released: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionCache {
    /// Creates a cache and the eviction channel its dispatcher will drain.
    pub fn new(
        default_ttl: Duration,
        analytics: AnalyticsClient,
    ) -> (Self, mpsc::UnboundedReceiver<Eviction>) {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();

        let cache = Self {
            inner: Arc::new(Mutex::new(CacheInner {
                by_id: HashMap::new(),
                by_deadline: BTreeSet::new(),
                reservations: HashMap::new(),
                next_reservation_token: 0,
            })),
            evict_tx,
            notify: Arc::new(Notify::new()),
            default_ttl,
            analytics,
        };

        (cache, evict_rx)
    }

    /// Inserts a session with a renewable `ttl`.
    ///
    /// The deadline is capped at the record's absolute lifetime limit. Any
    /// reservation held under the same sandbox id is released. Emits an
    /// "instance started" analytics event asynchronously.
    pub fn add(&self, record: SessionRecord, ttl: Duration) -> SandplaneResult<()> {
        let sandbox_id = record.get_sandbox_id().clone();

        {
            let mut inner = self.lock();

            if inner.by_id.contains_key(&sandbox_id) {
                return Err(SandplaneError::SandboxAlreadyExists(sandbox_id));
            }

            inner.reservations.remove(&sandbox_id);

            let deadline = cmp::min(deadline_after(Utc::now(), ttl), record.absolute_cap());
            inner.by_deadline.insert((deadline, sandbox_id.clone()));
            inner.by_id.insert(
                sandbox_id.clone(),
                CachedSession {
                    record: record.clone(),
                    deadline,
                },
            );
        }

        self.notify.notify_one();
        self.analytics.emit(AnalyticsEvent::InstanceStarted {
            sandbox_id,
            template_id: record.get_template_id().clone(),
            team_id: record.get_team_id().clone(),
            client_id: record.get_client_id().clone(),
            timestamp: Utc::now(),
        });

        Ok(())
    }

    /// Extends a session's deadline to `min(now + ttl, absolute cap)`.
    ///
    /// A refresh that would not extend the current deadline succeeds without
    /// mutation. A refresh past the absolute cap deletes the record (firing
    /// eviction) and returns [`SandplaneError::ReachedMaxLength`].
    pub fn refresh(&self, sandbox_id: &str, ttl: Duration) -> SandplaneResult<()> {
        let now = Utc::now();

        let expired = {
            let mut inner = self.lock();

            let Some(entry) = inner.by_id.get(sandbox_id) else {
                return Err(SandplaneError::SandboxNotFound(sandbox_id.to_string()));
            };

            let cap = entry.record.absolute_cap();
            let current_deadline = entry.deadline;

            if now >= cap {
                remove_locked(&mut inner, sandbox_id)
            } else {
                let new_deadline = cmp::min(deadline_after(now, ttl), cap);
                if new_deadline > current_deadline {
                    inner
                        .by_deadline
                        .remove(&(current_deadline, sandbox_id.to_string()));
                    inner
                        .by_deadline
                        .insert((new_deadline, sandbox_id.to_string()));
                    if let Some(entry) = inner.by_id.get_mut(sandbox_id) {
                        entry.deadline = new_deadline;
                    }
                }
                None
            }
        };

        match expired {
            Some(entry) => {
                self.dispatch(entry.record, EvictionReason::Expired);
                self.notify.notify_one();
                Err(SandplaneError::ReachedMaxLength(sandbox_id.to_string()))
            }
            None => {
                self.notify.notify_one();
                Ok(())
            }
        }
    }

    /// Non-refreshing read of a session.
    pub fn get(&self, sandbox_id: &str) -> Option<SessionRecord> {
        self.lock().by_id.get(sandbox_id).map(|e| e.record.clone())
    }

    /// The current deadline of a session.
    pub fn deadline(&self, sandbox_id: &str) -> Option<DateTime<Utc>> {
        self.lock().by_id.get(sandbox_id).map(|e| e.deadline)
    }

    /// Removes a session, firing the eviction path.
    pub fn kill(&self, sandbox_id: &str) -> SandplaneResult<()> {
        let entry = {
            let mut inner = self.lock();
            remove_locked(&mut inner, sandbox_id)
        };

        match entry {
            Some(entry) => {
                self.dispatch(entry.record, EvictionReason::Deleted);
                self.notify.notify_one();
                Ok(())
            }
            None => Err(SandplaneError::SandboxNotFound(sandbox_id.to_string())),
        }
    }

    /// The number of live sessions owned by `team_id`.
    pub fn count_for_team(&self, team_id: &str) -> usize {
        self.lock()
            .by_id
            .values()
            .filter(|e| e.record.get_team_id().as_deref() == Some(team_id))
            .count()
    }

    /// Live sessions, optionally filtered by team.
    pub fn list(&self, team_id: Option<&str>) -> Vec<SessionRecord> {
        self.lock()
            .by_id
            .values()
            .filter(|e| match team_id {
                Some(team) => e.record.get_team_id().as_deref() == Some(team),
                None => true,
            })
            .map(|e| e.record.clone())
            .collect()
    }

    /// Atomically checks the team quota and inserts a placeholder that holds
    /// a unit of it until released.
    ///
    /// The check counts live sessions plus outstanding reservations, so
    /// concurrent creates cannot overshoot the limit between the admission
    /// check and cache insertion.
    pub fn reserve(
        &self,
        sandbox_id: &str,
        team_id: Option<&str>,
        limit: usize,
    ) -> SandplaneResult<Reservation> {
        let token = {
            let mut inner = self.lock();

            if inner.by_id.contains_key(sandbox_id) || inner.reservations.contains_key(sandbox_id)
            {
                return Err(SandplaneError::SandboxAlreadyExists(sandbox_id.to_string()));
            }

            if let Some(team) = team_id {
                let live = inner
                    .by_id
                    .values()
                    .filter(|e| e.record.get_team_id().as_deref() == Some(team))
                    .count();
                let reserved = inner
                    .reservations
                    .values()
                    .filter(|r| r.team_id.as_deref() == Some(team))
                    .count();

                if live + reserved >= limit {
                    return Err(SandplaneError::TeamLimitExceeded {
                        team_id: team.to_string(),
                        limit,
                    });
                }
            }

            inner.next_reservation_token += 1;
            let token = inner.next_reservation_token;
            inner.reservations.insert(
                sandbox_id.to_string(),
                ReservationEntry {
                    team_id: team_id.map(str::to_string),
                    token,
                },
            );
            token
        };

        Ok(Reservation {
            cache: self.clone(),
            sandbox_id: sandbox_id.to_string(),
            token,
            released: false,
        })
    }

    /// The number of outstanding reservations held by `team_id`.
    pub fn reservations_for_team(&self, team_id: &str) -> usize {
        self.lock()
            .reservations
            .values()
            .filter(|r| r.team_id.as_deref() == Some(team_id))
            .count()
    }

    /// Replaces cache membership with the authoritative set: cached records
    /// not in `authoritative` are evicted, records in the list but not
    /// cached are inserted under the default TTL. Emits a "running
    /// instances" analytics event.
    pub fn sync(&self, authoritative: Vec<SessionRecord>) {
        let now = Utc::now();

        let (removed, all_ids) = {
            let mut inner = self.lock();

            let keep: HashSet<String> = authoritative
                .iter()
                .map(|r| r.get_sandbox_id().clone())
                .collect();

            let stale: Vec<String> = inner
                .by_id
                .keys()
                .filter(|id| !keep.contains(*id))
                .cloned()
                .collect();

            let removed: Vec<CachedSession> = stale
                .iter()
                .filter_map(|id| remove_locked(&mut inner, id))
                .collect();

            for record in authoritative {
                let sandbox_id = record.get_sandbox_id().clone();
                if inner.by_id.contains_key(&sandbox_id) {
                    continue;
                }

                let deadline =
                    cmp::min(deadline_after(now, self.default_ttl), record.absolute_cap());
                inner.by_deadline.insert((deadline, sandbox_id.clone()));
                inner
                    .by_id
                    .insert(sandbox_id, CachedSession { record, deadline });
            }

            let all_ids: Vec<String> = inner.by_id.keys().cloned().collect();
            (removed, all_ids)
        };

        for entry in removed {
            self.dispatch(entry.record, EvictionReason::Synced);
        }

        self.notify.notify_one();
        self.analytics.emit(AnalyticsEvent::RunningInstances {
            count: all_ids.len(),
            sandbox_ids: all_ids,
            timestamp: Utc::now(),
        });
    }

    /// Spawns the background task that evicts sessions as their deadlines
    /// pass. The task runs until aborted.
    pub fn spawn_expiry(&self) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            loop {
                let sleep_for = match cache.next_deadline() {
                    Some(deadline) => (deadline - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = cache.notify.notified() => continue,
                }

                for record in cache.pop_expired(Utc::now()) {
                    cache.dispatch(record, EvictionReason::Expired);
                }
            }
        })
    }

    /// Removes and returns every session whose deadline has passed.
    pub fn pop_expired(&self, now: DateTime<Utc>) -> Vec<SessionRecord> {
        let mut inner = self.lock();
        let mut expired = Vec::new();

        loop {
            let Some((deadline, sandbox_id)) = inner.by_deadline.iter().next().cloned() else {
                break;
            };
            if deadline > now {
                break;
            }

            if let Some(entry) = remove_locked(&mut inner, &sandbox_id) {
                expired.push(entry.record);
            }
        }

        expired
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().by_deadline.iter().next().map(|(d, _)| *d)
    }

    fn dispatch(&self, record: SessionRecord, reason: EvictionReason) {
        if self
            .evict_tx
            .send(Eviction { record, reason })
            .is_err()
        {
            tracing::warn!("eviction dispatcher is gone, teardown skipped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("session cache mutex poisoned")
    }

    fn release_reservation(&self, sandbox_id: &str, token: u64) {
        let mut inner = self.lock();
        if inner
            .reservations
            .get(sandbox_id)
            .is_some_and(|r| r.token == token)
        {
            inner.reservations.remove(sandbox_id);
        }
    }
}

impl Reservation {
    /// Releases the reservation.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cache.release_reservation(&self.sandbox_id, self.token);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn remove_locked(inner: &mut CacheInner, sandbox_id: &str) -> Option<CachedSession> {
    let entry = inner.by_id.remove(sandbox_id)?;
    inner
        .by_deadline
        .remove(&(entry.deadline, sandbox_id.to_string()));
    Some(entry)
}

fn deadline_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::max_value())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runtime::VmHandle, slot::Slot};
    use tokio::process::Command;

    fn test_cache() -> (SessionCache, mpsc::UnboundedReceiver<Eviction>) {
        SessionCache::new(Duration::from_secs(60), AnalyticsClient::disabled())
    }

    fn test_record(sandbox_id: &str, team_id: Option<&str>, max_len: Duration) -> SessionRecord {
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
            .max_instance_length(max_len)
            .handle(handle)
            .slot(Slot::new(0, "node-abcdefgh", sandbox_id))
            .build()
    }

    async fn shutdown_all(records: impl IntoIterator<Item = SessionRecord>) {
        for record in records {
            let _ = record.get_handle().shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_add_and_get() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();
        let record = test_record("sb-1", None, Duration::from_secs(3600));

        cache.add(record.clone(), Duration::from_secs(60))?;
        assert!(cache.get("sb-1").is_some());
        assert!(cache.get("sb-2").is_none());

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_capped_by_max_length() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();
        let record = test_record("sb-1", None, Duration::from_secs(10));

        cache.add(record.clone(), Duration::from_secs(3600))?;

        let deadline = cache.deadline("sb-1").expect("deadline");
        assert!(deadline <= record.absolute_cap());

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_is_monotonic() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();
        let record = test_record("sb-1", None, Duration::from_secs(3600));

        cache.add(record.clone(), Duration::from_secs(600))?;
        let before = cache.deadline("sb-1").expect("deadline");

        // A shorter ttl must not pull the deadline backwards.
        cache.refresh("sb-1", Duration::from_secs(1))?;
        assert_eq!(cache.deadline("sb-1"), Some(before));

        // A longer ttl extends it.
        cache.refresh("sb-1", Duration::from_secs(1800))?;
        assert!(cache.deadline("sb-1").expect("deadline") > before);

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_past_cap_evicts() -> SandplaneResult<()> {
        let (cache, mut rx) = test_cache();
        let record = test_record("sb-1", None, Duration::ZERO);

        cache.add(record.clone(), Duration::from_secs(60))?;

        let result = cache.refresh("sb-1", Duration::from_secs(60));
        assert!(matches!(result, Err(SandplaneError::ReachedMaxLength(_))));
        assert!(cache.get("sb-1").is_none());

        let eviction = rx.recv().await.expect("eviction fired");
        assert_eq!(eviction.reason, EvictionReason::Expired);
        assert_eq!(eviction.record.get_sandbox_id(), "sb-1");

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_unknown_sandbox() {
        let (cache, _rx) = test_cache();
        assert!(matches!(
            cache.refresh("ghost", Duration::from_secs(60)),
            Err(SandplaneError::SandboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_fires_eviction() -> SandplaneResult<()> {
        let (cache, mut rx) = test_cache();
        let record = test_record("sb-1", None, Duration::from_secs(3600));

        cache.add(record.clone(), Duration::from_secs(60))?;
        cache.kill("sb-1")?;

        assert!(cache.get("sb-1").is_none());
        let eviction = rx.recv().await.expect("eviction fired");
        assert_eq!(eviction.reason, EvictionReason::Deleted);

        // Killing again is NotFound, not a double eviction.
        assert!(matches!(
            cache.kill("sb-1"),
            Err(SandplaneError::SandboxNotFound(_))
        ));

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_enforces_team_limit() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();

        let r1 = cache.reserve("sb-1", Some("team-a"), 2)?;
        let _r2 = cache.reserve("sb-2", Some("team-a"), 2)?;

        assert!(matches!(
            cache.reserve("sb-3", Some("team-a"), 2),
            Err(SandplaneError::TeamLimitExceeded { .. })
        ));

        // Releasing frees a unit of quota.
        r1.release();
        assert!(cache.reserve("sb-3", Some("team-a"), 2).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_add_releases_reservation() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();
        let record = test_record("sb-1", Some("team-a"), Duration::from_secs(3600));

        let reservation = cache.reserve("sb-1", Some("team-a"), 1)?;
        cache.add(record.clone(), Duration::from_secs(60))?;

        assert_eq!(cache.reservations_for_team("team-a"), 0);
        assert_eq!(cache.count_for_team("team-a"), 1);

        // The stale guard must not disturb a future reservation under the
        // same id.
        drop(reservation);
        assert_eq!(cache.count_for_team("team-a"), 1);

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_reserved_plus_live_never_exceeds_limit() -> SandplaneResult<()> {
        let (cache, _rx) = test_cache();
        let record = test_record("sb-1", Some("team-a"), Duration::from_secs(3600));

        let _live = cache.reserve("sb-1", Some("team-a"), 2)?;
        cache.add(record.clone(), Duration::from_secs(60))?;
        let _pending = cache.reserve("sb-2", Some("team-a"), 2)?;

        assert!(matches!(
            cache.reserve("sb-3", Some("team-a"), 2),
            Err(SandplaneError::TeamLimitExceeded { .. })
        ));
        assert!(
            cache.count_for_team("team-a") + cache.reservations_for_team("team-a") <= 2,
            "limit invariant violated"
        );

        shutdown_all([record]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_converges_membership() -> SandplaneResult<()> {
        let (cache, mut rx) = test_cache();
        let a = test_record("sb-a", None, Duration::from_secs(3600));
        let b = test_record("sb-b", None, Duration::from_secs(3600));
        let c = test_record("sb-c", None, Duration::from_secs(3600));
        let d = test_record("sb-d", None, Duration::from_secs(3600));

        cache.add(a.clone(), Duration::from_secs(60))?;
        cache.add(b.clone(), Duration::from_secs(60))?;
        cache.add(c.clone(), Duration::from_secs(60))?;

        cache.sync(vec![b.clone(), d.clone()]);

        let mut ids: Vec<String> = cache
            .list(None)
            .into_iter()
            .map(|r| r.get_sandbox_id().clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["sb-b".to_string(), "sb-d".to_string()]);

        let mut evicted: Vec<String> = Vec::new();
        for _ in 0..2 {
            let eviction = rx.recv().await.expect("eviction fired");
            assert_eq!(eviction.reason, EvictionReason::Synced);
            evicted.push(eviction.record.get_sandbox_id().clone());
        }
        evicted.sort();
        assert_eq!(evicted, vec!["sb-a".to_string(), "sb-c".to_string()]);

        shutdown_all([a, b, c, d]).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_task_evicts_past_deadline() -> SandplaneResult<()> {
        let (cache, mut rx) = test_cache();
        let record = test_record("sb-1", None, Duration::from_secs(3600));

        let expiry = cache.spawn_expiry();
        cache.add(record.clone(), Duration::from_millis(50))?;

        let eviction =
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("expiry fired in time")
                .expect("eviction");
        assert_eq!(eviction.reason, EvictionReason::Expired);
        assert!(cache.get("sb-1").is_none());

        expiry.abort();
        shutdown_all([record]).await;
        Ok(())
    }
}
