//! Pluggable persistence for cache entries, ledger entries, and breaker state.
//!
//! The pipeline never requires persistence - every component works in pure
//! memory against [`NullStorageAdapter`] - but components that are given a
//! real adapter warm themselves from it on construction (`hydrate`) and
//! write through to it on every mutation. Storage failures never propagate
//! to the caller; they are logged and reported through `OnStorageError`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::ShieldResult;

/// A key/value persistence backend. All operations are async to allow
/// real I/O (files, a database, a remote KV store) without blocking the
/// pipeline's executor.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> ShieldResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> ShieldResult<()>;
    async fn delete(&self, key: &str) -> ShieldResult<()>;
    /// List every key under the adapter's namespace, used by `hydrate()`
    /// implementations that need to enumerate previously stored entries.
    async fn keys(&self) -> ShieldResult<Vec<String>>;
}

/// The default adapter: every read misses, every write is a no-op. Matches
/// §6's "may be unavailable, in which case all persistence is no-op".
#[derive(Debug, Default, Clone)]
pub struct NullStorageAdapter;

#[async_trait]
impl StorageAdapter for NullStorageAdapter {
    async fn get(&self, _key: &str) -> ShieldResult<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> ShieldResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> ShieldResult<()> {
        Ok(())
    }

    async fn keys(&self) -> ShieldResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// An in-process, in-memory adapter. Used by tests and as a ready-made
/// non-null default for single-process deployments that still want
/// hydration/restart semantics without standing up real infrastructure.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorageAdapter {
    data: Arc<DashMap<String, String>>,
}

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn get(&self, key: &str) -> ShieldResult<Option<String>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> ShieldResult<()> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> ShieldResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn keys(&self) -> ShieldResult<Vec<String>> {
        Ok(self.data.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    // UNIT UNDER TEST: NullStorageAdapter and InMemoryStorageAdapter
    // BUSINESS RESPONSIBILITY: NullStorageAdapter must never report success
    //   on a read after a write (it never stores anything); InMemoryStorageAdapter
    //   must round-trip values and support deletion.
    // TEST COVERAGE:
    //   - null adapter always misses
    //   - in-memory adapter round-trips and deletes
    //   - in-memory adapter's keys() reflects current contents

    #[tokio::test]
    async fn null_adapter_never_returns_a_stored_value() {
        // Arrange
        let adapter = NullStorageAdapter;

        // Act
        adapter.set("k", "v").await.unwrap();
        let got = adapter.get("k").await.unwrap();

        // Assert
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn in_memory_adapter_round_trips_values() {
        // Arrange
        let adapter = InMemoryStorageAdapter::new();

        // Act
        adapter.set("cache:abc", "payload").await.unwrap();
        let got = adapter.get("cache:abc").await.unwrap();

        // Assert
        assert_eq!(got.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn in_memory_adapter_delete_removes_key() {
        // Arrange
        let adapter = InMemoryStorageAdapter::new();
        adapter.set("k", "v").await.unwrap();

        // Act
        adapter.delete("k").await.unwrap();
        let got = adapter.get("k").await.unwrap();
        let keys = adapter.keys().await.unwrap();

        // Assert
        assert!(got.is_none());
        assert!(keys.is_empty());
    }
}
