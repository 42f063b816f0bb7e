//! Storage-wide persisted aggregates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::warn;

use super::StorageError;
use crate::fs_util::write_atomic;

/// Aggregates persisted alongside the metadata files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveData {
    pub total_uploaded_bytes: u64,
}

/// Turns the engine's running upload counter into increments.
///
/// The counter restarts from zero with every engine session. A value lower
/// than the last one seen is taken as such a restart. Single increments larger
/// than `max_delta` are discarded as implausible.
#[derive(Debug, Clone)]
pub struct UploadAccounting {
    last_seen: u64,
    max_delta: u64,
}

impl UploadAccounting {
    pub fn new(max_delta: u64) -> Self {
        Self {
            last_seen: 0,
            max_delta,
        }
    }

    /// Records the engine's current counter, returning the bytes to add.
    pub fn observe(&mut self, uploaded_bytes: u64) -> u64 {
        if uploaded_bytes < self.last_seen {
            self.last_seen = uploaded_bytes;
            return 0;
        }

        let delta = uploaded_bytes - self.last_seen;
        self.last_seen = uploaded_bytes;
        if delta > self.max_delta {
            warn!(delta, max_delta = self.max_delta, "Discarding implausible upload delta");
            return 0;
        }
        delta
    }
}

/// [`SaveData`] mirrored to a JSON file.
///
/// Readers see the last total that reached disk; updates are serialized by
/// `write_lock` and published only after the file write succeeded.
pub struct SaveDataStore {
    path: PathBuf,
    committed: watch::Sender<SaveData>,
    write_lock: Mutex<()>,
}

impl SaveDataStore {
    /// Loads the file at `path`. Missing or corrupt files start from zero.
    pub async fn load(path: PathBuf) -> Self {
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt storage data");
                SaveData::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SaveData::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read storage data");
                SaveData::default()
            }
        };

        let (committed, _) = watch::channel(data);
        Self {
            path,
            committed,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last committed data. Never blocks on an update in flight.
    pub fn get(&self) -> SaveData {
        *self.committed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveData> {
        self.committed.subscribe()
    }

    /// Adds `delta` uploaded bytes and persists the new total.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - The file could not be written
    /// - `StorageError::Serialization` - The data could not be encoded
    pub async fn add_uploaded(&self, delta: u64) -> Result<SaveData, StorageError> {
        let _write = self.write_lock.lock().await;
        let mut updated = self.get();
        updated.total_uploaded_bytes = updated.total_uploaded_bytes.saturating_add(delta);

        let bytes = serde_json::to_vec(&updated).map_err(|source| StorageError::Serialization {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).await?;

        self.committed.send_replace(updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting_counts_increments() {
        let mut accounting = UploadAccounting::new(1_000);

        assert_eq!(accounting.observe(100), 100);
        assert_eq!(accounting.observe(100), 0);
        assert_eq!(accounting.observe(350), 250);
    }

    #[test]
    fn test_accounting_treats_decrease_as_restart() {
        let mut accounting = UploadAccounting::new(1_000);
        accounting.observe(800);

        assert_eq!(accounting.observe(50), 0);
        assert_eq!(accounting.observe(70), 20);
    }

    #[test]
    fn test_accounting_discards_implausible_delta() {
        let mut accounting = UploadAccounting::new(1_000);
        accounting.observe(500);

        assert_eq!(accounting.observe(500 + 5_000), 0);
        // The spike becomes the new baseline.
        assert_eq!(accounting.observe(5_600), 100);
    }

    #[tokio::test]
    async fn test_store_persists_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-data.json");

        let store = SaveDataStore::load(path.clone()).await;
        assert_eq!(store.get(), SaveData::default());
        store.add_uploaded(10).await.unwrap();
        store.add_uploaded(32).await.unwrap();

        let reloaded = SaveDataStore::load(path).await;
        assert_eq!(reloaded.get().total_uploaded_bytes, 42);
    }

    #[tokio::test]
    async fn test_total_stays_readable_during_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = SaveDataStore::load(dir.path().join("storage-data.json")).await;
        store.add_uploaded(1_000).await.unwrap();

        // Same lock an in-flight `add_uploaded` holds while writing.
        let _write = store.write_lock.lock().await;

        assert_eq!(store.get().total_uploaded_bytes, 1_000);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_committed_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-data.json");
        let store = SaveDataStore::load(path).await;
        store.add_uploaded(1_000).await.unwrap();
        let updates = store.subscribe();

        // Without its directory the write fails.
        drop(dir);
        assert!(store.add_uploaded(500).await.is_err());

        assert_eq!(store.get().total_uploaded_bytes, 1_000);
        assert!(!updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_store_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-data.json");
        std::fs::write(&path, b"garbage").unwrap();

        let store = SaveDataStore::load(path).await;

        assert_eq!(store.get(), SaveData::default());
    }
}
