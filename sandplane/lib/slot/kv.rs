use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use getset::Getters;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use crate::{SandplaneError, SandplaneResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A key's current value and version in the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct KvEntry {
    /// The stored value bytes.
    value: Vec<u8>,

    /// The version used for compare-and-swap operations. Never zero for an
    /// existing key; zero in a CAS put means "key must not exist".
    modify_index: u64,
}

/// A distributed key-value store supporting compare-and-swap writes.
///
/// Only three operations are needed: create-if-absent, read, and
/// delete-at-version. Both CAS operations report success as a boolean rather
/// than an error, so callers can distinguish "lost the race" from real I/O
/// failures.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes `value` at `key` iff the key's current modify index equals
    /// `modify_index`. With `modify_index == 0` the write succeeds only if
    /// the key does not exist. Returns whether the write was applied.
    async fn put_cas(&self, key: &str, value: &[u8], modify_index: u64) -> SandplaneResult<bool>;

    /// Reads the entry at `key`, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> SandplaneResult<Option<KvEntry>>;

    /// Deletes `key` iff its current modify index equals `modify_index`.
    /// Returns whether the delete was applied.
    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandplaneResult<bool>;
}

/// KV store client speaking JSON over HTTP to an external store.
///
/// The wire protocol is a consul-style KV surface:
/// `GET/PUT/DELETE {address}/v1/kv/{key}`, with `?cas={modify_index}` on
/// writes and deletes. Transient failures are retried by the middleware.
pub struct HttpKvStore {
    /// Base address of the store, e.g. `http://127.0.0.1:8500`.
    address: String,

    /// Bearer token attached to every request, if configured.
    token: Option<String>,

    /// HTTP client with retry middleware.
    client: ClientWithMiddleware,
}

/// In-process KV store with the same CAS semantics.
///
/// Used by tests and by single-node deployments that run without an external
/// store. Slot uniqueness then only holds within one process, which is exactly
/// the single-allocator case.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<MemoryKvInner>,
}

#[derive(Debug, Default)]
struct MemoryKvInner {
    entries: HashMap<String, KvEntry>,
    next_index: u64,
}

#[derive(Debug, Deserialize)]
struct HttpKvGetResponse {
    value: String,
    modify_index: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KvEntry {
    /// Creates an entry from raw parts.
    pub fn new(value: impl Into<Vec<u8>>, modify_index: u64) -> Self {
        Self {
            value: value.into(),
            modify_index,
        }
    }

    /// The stored value as UTF-8, replacing invalid bytes.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

impl HttpKvStore {
    /// Creates a client for the store at `address`.
    pub fn new(address: impl Into<String>, token: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(100), Duration::from_secs(2))
            .build_with_max_retries(3);

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            address: address.into(),
            token,
            client,
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.address.trim_end_matches('/'), key)
    }

    fn authorized(
        &self,
        request: reqwest_middleware::RequestBuilder,
    ) -> reqwest_middleware::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KvStore for HttpKvStore {
    async fn put_cas(&self, key: &str, value: &[u8], modify_index: u64) -> SandplaneResult<bool> {
        let response = self
            .authorized(self.client.put(self.key_url(key)))
            .query(&[("cas", modify_index)])
            .body(value.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SandplaneError::KvStore(format!(
                "put {} returned {}",
                key,
                response.status()
            )));
        }

        let applied: bool = response.json().await?;
        Ok(applied)
    }

    async fn get(&self, key: &str) -> SandplaneResult<Option<KvEntry>> {
        let response = self
            .authorized(self.client.get(self.key_url(key)))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(SandplaneError::KvStore(format!(
                "get {} returned {}",
                key,
                response.status()
            )));
        }

        let body: HttpKvGetResponse = response.json().await?;
        Ok(Some(KvEntry::new(
            body.value.into_bytes(),
            body.modify_index,
        )))
    }

    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandplaneResult<bool> {
        let response = self
            .authorized(self.client.delete(self.key_url(key)))
            .query(&[("cas", modify_index)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SandplaneError::KvStore(format!(
                "delete {} returned {}",
                key,
                response.status()
            )));
        }

        let applied: bool = response.json().await?;
        Ok(applied)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put_cas(&self, key: &str, value: &[u8], modify_index: u64) -> SandplaneResult<bool> {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");

        let current_index = inner.entries.get(key).map(|e| e.modify_index).unwrap_or(0);
        if current_index != modify_index {
            return Ok(false);
        }

        inner.next_index += 1;
        let next_index = inner.next_index;
        inner
            .entries
            .insert(key.to_string(), KvEntry::new(value.to_vec(), next_index));
        Ok(true)
    }

    async fn get(&self, key: &str) -> SandplaneResult<Option<KvEntry>> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        Ok(inner.entries.get(key).cloned())
    }

    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandplaneResult<bool> {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");

        match inner.entries.get(key) {
            Some(entry) if entry.modify_index == modify_index => {
                inner.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_create_if_absent() -> SandplaneResult<()> {
        let kv = MemoryKvStore::new();

        assert!(kv.put_cas("n1/0", b"session-a", 0).await?);
        // Second create-if-absent on the same key loses the race.
        assert!(!kv.put_cas("n1/0", b"session-b", 0).await?);

        let entry = kv.get("n1/0").await?.unwrap();
        assert_eq!(entry.value_str(), "session-a");
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_kv_delete_cas() -> SandplaneResult<()> {
        let kv = MemoryKvStore::new();
        kv.put_cas("n1/0", b"session-a", 0).await?;

        let entry = kv.get("n1/0").await?.unwrap();
        // Deleting at a stale index is refused.
        assert!(!kv.delete_cas("n1/0", entry.modify_index + 1).await?);
        assert!(kv.delete_cas("n1/0", entry.modify_index).await?);
        assert!(kv.get("n1/0").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_kv_index_advances() -> SandplaneResult<()> {
        let kv = MemoryKvStore::new();
        kv.put_cas("n1/0", b"a", 0).await?;
        let first = kv.get("n1/0").await?.unwrap().modify_index;

        kv.delete_cas("n1/0", first).await?;
        kv.put_cas("n1/0", b"b", 0).await?;
        let second = kv.get("n1/0").await?.unwrap().modify_index;

        assert!(second > first);
        Ok(())
    }
}
