//! Typed record access over a [`ResourceStore`]

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stride_common::retry::{retry_if_retryable, RetryConfig};
use stride_common::Result;
use tracing::{debug, warn};

use crate::codec;
use crate::store::{ResourceStore, SnapshotToken};

/// A record type persisted under a fixed key
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Store key
    const KEY: &'static str;
    /// Human-readable kind used in logs and errors
    const KIND: &'static str;
}

/// A loaded record with the snapshot it was read at
#[derive(Debug, Clone)]
pub struct Stored<T> {
    /// The decoded record
    pub value: T,
    /// Snapshot token for the next compare-and-swap
    pub snapshot: SnapshotToken,
    /// True if the blob was written by an older build and should be re-persisted
    pub normalized: bool,
}

/// Typed, retrying access to persisted records
#[derive(Clone)]
pub struct StoreManager {
    store: Arc<dyn ResourceStore>,
    retry: RetryConfig,
}

impl StoreManager {
    /// Create a manager over `store`; transient failures are retried per `retry`
    pub fn new(store: Arc<dyn ResourceStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// The underlying raw store
    pub fn raw(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Load a record, or `None` if it was never written
    pub async fn load<T: Record>(&self) -> Result<Option<Stored<T>>> {
        let store = self.store.clone();
        let versioned = retry_if_retryable(&self.retry, "store.load", || {
            let store = store.clone();
            async move { store.get(T::KEY).await }
        })
        .await?;

        let Some(versioned) = versioned else {
            return Ok(None);
        };

        let decoded = codec::decode::<T>(T::KIND, &versioned.value)?;
        if decoded.normalized {
            debug!(key = T::KEY, "loaded record requires re-persisting");
        }
        Ok(Some(Stored {
            value: decoded.value,
            snapshot: versioned.token,
            normalized: decoded.normalized,
        }))
    }

    /// Write a record guarded by `expected`
    ///
    /// `None` requires the record not to exist yet. A conflict is returned
    /// to the caller without retrying.
    pub async fn save<T: Record>(
        &self,
        value: &T,
        expected: Option<&SnapshotToken>,
    ) -> Result<SnapshotToken> {
        let blob = codec::encode(T::KIND, value)?;
        let store = self.store.clone();
        let expected = expected.cloned();
        let result = retry_if_retryable(&self.retry, "store.save", || {
            let store = store.clone();
            let blob = blob.clone();
            let expected = expected.clone();
            async move { store.put(T::KEY, &blob, expected).await }
        })
        .await;

        if let Err(e) = &result {
            if e.is_conflict() {
                warn!(key = T::KEY, error = %e, "write lost optimistic concurrency race");
            }
        }
        result
    }

    /// Persist a loaded record back at its own snapshot
    pub async fn save_stored<T: Record>(&self, stored: &Stored<T>) -> Result<SnapshotToken> {
        self.save(&stored.value, Some(&stored.snapshot)).await
    }

    /// Read-modify-write of a record that defaults when absent
    ///
    /// A single attempt: a conflict surfaces to the caller.
    pub async fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        T: Record + Default,
        F: FnOnce(&mut T),
    {
        let loaded = self.load::<T>().await?;
        let (mut value, snapshot) = match loaded {
            Some(stored) => (stored.value, Some(stored.snapshot)),
            None => (T::default(), None),
        };
        mutate(&mut value);
        self.save(&value, snapshot.as_ref()).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    impl Record for Counter {
        const KEY: &'static str = "counter";
        const KIND: &'static str = "Counter";
    }

    fn manager(store: Arc<MemoryStore>) -> StoreManager {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };
        StoreManager::new(store, retry)
    }

    #[tokio::test]
    async fn two_writers_on_one_snapshot_exactly_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        mgr.save(&Counter { count: 0 }, None).await.unwrap();

        let a = mgr.load::<Counter>().await.unwrap().unwrap();
        let b = mgr.load::<Counter>().await.unwrap().unwrap();

        let first = mgr.save(&Counter { count: 1 }, Some(&a.snapshot)).await;
        let second = mgr.save(&Counter { count: 2 }, Some(&b.snapshot)).await;

        assert!(first.is_ok());
        assert!(second.unwrap_err().is_conflict());
        let stored = mgr.load::<Counter>().await.unwrap().unwrap();
        assert_eq!(stored.value.count, 1);
    }

    #[tokio::test]
    async fn update_creates_then_modifies() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store);
        mgr.update::<Counter, _>(|c| c.count += 1).await.unwrap();
        let after = mgr.update::<Counter, _>(|c| c.count += 1).await.unwrap();
        assert_eq!(after.count, 2);
    }

    #[tokio::test]
    async fn legacy_blob_is_flagged_for_repersist() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("counter", r#"{"count": 4}"#);
        let mgr = manager(store.clone());

        let loaded = mgr.load::<Counter>().await.unwrap().unwrap();
        assert!(loaded.normalized);
        assert_eq!(loaded.value.count, 4);

        mgr.save_stored(&loaded).await.unwrap();
        let reloaded = mgr.load::<Counter>().await.unwrap().unwrap();
        assert!(!reloaded.normalized);
    }

    #[tokio::test]
    async fn missing_record_loads_as_none() {
        let mgr = manager(Arc::new(MemoryStore::new()));
        assert!(mgr.load::<Counter>().await.unwrap().is_none());
    }
}
