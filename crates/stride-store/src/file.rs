//! Directory-backed store: one JSON file per key

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stride_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{check_precondition, ResourceStore, SnapshotToken, Versioned};

/// Store that keeps each record in `<root>/<key>.json`
///
/// Writes go through a temp file in the same directory and an atomic rename,
/// serialized by an async mutex so the compare and the swap are one step.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::store(root.display().to_string(), format!("failed to create store directory: {}", e))
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(Error::validation(format!("invalid record key '{}'", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }

    async fn read(path: &Path, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(key, format!("read failed: {}", e))),
        }
    }
}

#[async_trait]
impl ResourceStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let path = self.path_for(key)?;
        Ok(Self::read(&path, key).await?.map(|value| Versioned {
            token: SnapshotToken::new(value.clone()),
            value,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        expected: Option<SnapshotToken>,
    ) -> Result<SnapshotToken> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read(&path, key).await?;
        check_precondition(key, current.as_deref(), expected.as_ref())?;

        let root = self.root.clone();
        let blob = value.to_string();
        let target = path.clone();
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)
                .map_err(|e| Error::store(&owned_key, format!("temp file: {}", e)))?;
            tmp.write_all(blob.as_bytes())
                .and_then(|_| tmp.as_file().sync_all())
                .map_err(|e| Error::store(&owned_key, format!("write failed: {}", e)))?;
            tmp.persist(&target)
                .map_err(|e| Error::store(&owned_key, format!("rename failed: {}", e.error)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal_with_context("file_store", format!("write task failed: {}", e)))??;

        debug!(key, path = %path.display(), "record written");
        Ok(SnapshotToken::new(value))
    }
}
