//! In-process store, used for embedding and tests

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use stride_common::Result;

use crate::store::{check_precondition, ResourceStore, SnapshotToken, Versioned};

/// Store backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw blob under `key`, bypassing snapshot bookkeeping
    pub fn raw(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).cloned()
    }

    /// Overwrite `key` unconditionally, as an out-of-band writer would
    pub fn insert_raw(&self, key: &str, blob: impl Into<String>) {
        self.records.lock().insert(key.to_string(), blob.into());
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.records.lock().get(key).map(|value| Versioned {
            value: value.clone(),
            token: SnapshotToken::new(value.clone()),
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: Option<SnapshotToken>,
    ) -> Result<SnapshotToken> {
        let mut records = self.records.lock();
        check_precondition(key, records.get(key).map(String::as_str), expected.as_ref())?;
        records.insert(key.to_string(), value.to_string());
        Ok(SnapshotToken::new(value))
    }
}
