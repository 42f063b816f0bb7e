//! Cache entries and the pluggable engines that perform the transfer.
//!
//! A [`MediaCache`] is one persisted, resumable download of a single episode.
//! Engines implement [`MediaCacheEngine`] and are selected when a storage is
//! constructed; storages only ever talk to the trait.

pub mod media;
pub mod metadata;
pub mod torrent_engine;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
pub use media::{CachedMedia, Media, MediaProperties, MediaSourceKind, ResourceLocation};
pub use metadata::{EpisodeSort, MediaCacheMetadata, calculate_cache_id};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
pub use torrent_engine::{TorrentMediaCache, TorrentMediaCacheEngine, select_episode_file};

use crate::stats::{FileStats, SessionStats};
use crate::torrent::TorrentError;

/// Whether a cache is actively downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaCacheState {
    InProgress,
    Paused,
}

/// One cached episode.
///
/// `pause`, `resume` and `close` are silent no-ops when the cache can no
/// longer act on them, e.g. after deletion.
#[async_trait]
pub trait MediaCache: Send + Sync {
    /// Stable id, also the stem of the cache's metadata file.
    fn cache_id(&self) -> &str;

    /// Media this cache was created from.
    fn origin(&self) -> &Media;

    fn metadata(&self) -> &MediaCacheMetadata;

    fn state(&self) -> watch::Receiver<MediaCacheState>;

    fn is_deleted(&self) -> bool;

    /// Continuously updated statistics of the cached file.
    fn file_stats(&self) -> watch::Receiver<FileStats>;

    /// Continuously updated statistics of the whole download session.
    fn session_stats(&self) -> watch::Receiver<SessionStats>;

    /// Describes the cache as locally playable media.
    ///
    /// # Errors
    ///
    /// - `CacheError::Deleted` - The cache files were removed
    async fn cached_media(&self) -> Result<CachedMedia, CacheError>;

    /// # Errors
    ///
    /// - `CacheError::Torrent` - The engine rejected the change
    async fn pause(&self) -> Result<(), CacheError>;

    /// # Errors
    ///
    /// - `CacheError::Torrent` - The engine rejected the change
    async fn resume(&self) -> Result<(), CacheError>;

    /// Stops the transfer and releases resources, keeping files on disk.
    ///
    /// # Errors
    ///
    /// - `CacheError::Torrent` - The session failed to shut down
    async fn close(&self) -> Result<(), CacheError>;

    /// Releases resources and removes every file of the cache.
    ///
    /// Cleanup runs to completion even if the calling future is dropped.
    ///
    /// # Errors
    ///
    /// - `CacheError::Torrent` - The session failed to shut down
    /// - `CacheError::Io` - Files could not be removed
    async fn close_and_delete_files(&self) -> Result<(), CacheError>;
}

/// Creates and restores caches for the media kinds it supports.
#[async_trait]
pub trait MediaCacheEngine: Send + Sync {
    fn supports(&self, media: &Media) -> bool;

    /// Aggregate transfer statistics of every cache of this engine.
    fn stats(&self) -> watch::Receiver<SessionStats>;

    /// Starts a new cache. The cache is created paused.
    ///
    /// # Errors
    ///
    /// - `CacheError::Unsupported` - `supports` returns false for the media
    /// - `CacheError::Initialization` - The transfer could not be set up
    async fn create_cache(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Arc<dyn MediaCache>, CacheError>;

    /// Reconstructs a cache from persisted data.
    ///
    /// Returns `None` when this engine cannot handle the media.
    ///
    /// # Errors
    ///
    /// - `CacheError::Initialization` - The transfer could not be set up
    async fn restore(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Option<Arc<dyn MediaCache>>, CacheError>;

    /// Deletes on-disk artifacts whose cache id is not in `known_cache_ids`.
    ///
    /// Callers include the ids of saved caches that failed to restore, so
    /// their downloads survive until a later attempt.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - The engine directory could not be listed
    async fn delete_unused_caches(&self, known_cache_ids: &HashSet<String>)
    -> Result<(), CacheError>;
}

/// Errors raised by caches and engines.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Media {media_id} is not supported by this engine")]
    Unsupported { media_id: String },

    #[error("Failed to initialize cache {cache_id}")]
    Initialization {
        cache_id: String,
        #[source]
        source: TorrentError,
    },

    #[error("Cache {cache_id} was deleted")]
    Deleted { cache_id: String },

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Cache task failed: {reason}")]
    Task { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
