//! Persistent storages of media caches.
//!
//! A storage owns the list of caches it created or restored and mirrors that
//! list on disk, one small metadata file per cache. The actual transfer is
//! delegated to a [`MediaCacheEngine`](crate::cache::MediaCacheEngine).

pub mod directory;
pub mod metadata_file;
pub mod save_data;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
pub use directory::DirectoryMediaCacheStorage;
pub use metadata_file::{MediaCacheSave, list_metadata_files, metadata_path, read_save, write_save};
pub use save_data::{SaveData, SaveDataStore, UploadAccounting};
use tokio::sync::watch;

use crate::cache::{CacheError, Media, MediaCache, MediaCacheMetadata};
use crate::stats::SessionStats;

/// Predicate used by [`MediaCacheStorage::delete_first`].
pub type CachePredicate<'a> = &'a (dyn Fn(&dyn MediaCache) -> bool + Send + Sync);

/// A persistent collection of media caches backed by one engine.
#[async_trait]
pub trait MediaCacheStorage: Send + Sync {
    /// Stable identifier of this storage.
    fn id(&self) -> &str;

    /// Whether this storage's engine can cache `media`.
    fn supports(&self, media: &Media) -> bool;

    /// Live view of the caches, updated after every mutation.
    fn subscribe(&self) -> watch::Receiver<Vec<Arc<dyn MediaCache>>>;

    /// Snapshot of the caches.
    fn caches(&self) -> Vec<Arc<dyn MediaCache>> {
        self.subscribe().borrow().clone()
    }

    /// Looks up a cache by id.
    fn find(&self, cache_id: &str) -> Option<Arc<dyn MediaCache>> {
        self.caches()
            .into_iter()
            .find(|cache| cache.cache_id() == cache_id)
    }

    /// Aggregate transfer statistics of the engine.
    fn stats(&self) -> watch::Receiver<SessionStats>;

    /// Bytes uploaded over the lifetime of this storage.
    fn total_uploaded_bytes(&self) -> u64;

    /// Creates a cache for `media`, or returns the existing one with the
    /// same cache id.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnsupportedMedia` - The engine cannot cache `media`
    /// - `StorageError::Cache` - The engine failed to create the cache
    /// - `StorageError::Io` - The metadata file could not be written
    /// - `StorageError::Closed` - The storage was closed
    async fn cache(
        &self,
        media: Media,
        metadata: MediaCacheMetadata,
        resume: bool,
    ) -> Result<Arc<dyn MediaCache>, StorageError>;

    /// Deletes the cache with `cache_id` and its files.
    ///
    /// Returns false if no such cache exists.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - The metadata file could not be removed
    /// - `StorageError::Cache` - The cache failed to delete its files
    async fn delete(&self, cache_id: &str) -> Result<bool, StorageError>;

    /// Deletes the first cache matching `predicate`.
    ///
    /// Returns false if no cache matched.
    ///
    /// # Errors
    ///
    /// Same as [`MediaCacheStorage::delete`].
    async fn delete_first(&self, predicate: CachePredicate<'_>) -> Result<bool, StorageError>;

    /// Stops background work and closes every cache. The files stay on disk.
    ///
    /// # Errors
    ///
    /// - `StorageError::Cache` - The first cache that failed to close
    async fn close(&self) -> Result<(), StorageError>;
}

/// Errors that occur in cache storages.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Media {media_id} is not supported by storage {storage_id}")]
    UnsupportedMedia { storage_id: String, media_id: String },

    #[error("Storage {storage_id} is closed")]
    Closed { storage_id: String },

    #[error("Malformed cache file {path}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
