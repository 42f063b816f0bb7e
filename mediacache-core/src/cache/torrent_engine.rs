//! Cache engine backed by the external BitTorrent downloader.
//!
//! Each cache gets its own directory `<base>/<cacheId>` holding the fetched
//! torrent data and the downloaded files. Restoration reuses the stored
//! torrent data so no network round trip is needed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CacheError, CachedMedia, Media, MediaCache, MediaCacheEngine, MediaCacheMetadata,
    MediaCacheState, ResourceLocation, calculate_cache_id,
};
use crate::config::{EngineConfig, ReaderConfig};
use crate::fs_util::{remove_dir_if_exists, write_atomic};
use crate::stats::{FileStats, SessionStats};
use crate::streaming::TorrentInput;
use crate::torrent::{
    FilePriority, TorrentData, TorrentDownloader, TorrentError, TorrentFileEntry,
    TorrentFileHandle, TorrentSession,
};

const TORRENT_DATA_FILE: &str = "torrent.data";

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "webm", "mov", "m4v", "flv", "ts", "wmv", "rmvb",
];

/// Picks the file of a torrent that holds the episode.
///
/// Prefers the file named by `hint`, then the largest video file, then the
/// largest file of any kind.
pub fn select_episode_file<'a>(
    entries: &'a [Arc<TorrentFileEntry>],
    hint: Option<&str>,
) -> Option<&'a Arc<TorrentFileEntry>> {
    if let Some(hint) = hint
        && let Some(entry) = entries.iter().find(|e| e.path_in_torrent() == hint)
    {
        return Some(entry);
    }

    entries
        .iter()
        .filter(|entry| is_video(entry.path_in_torrent()))
        .max_by_key(|entry| entry.length())
        .or_else(|| entries.iter().max_by_key(|entry| entry.length()))
}

fn is_video(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|video| video.eq_ignore_ascii_case(ext))
        })
}

/// Media cache engine for magnet links and `.torrent` URLs.
pub struct TorrentMediaCacheEngine {
    downloader: Arc<dyn TorrentDownloader>,
    base_directory: PathBuf,
    config: EngineConfig,
    reader: ReaderConfig,
}

impl TorrentMediaCacheEngine {
    pub fn new(
        downloader: Arc<dyn TorrentDownloader>,
        base_directory: PathBuf,
        config: EngineConfig,
    ) -> Self {
        Self {
            downloader,
            base_directory,
            config,
            reader: ReaderConfig::default(),
        }
    }

    /// Sets the buffering of readers opened by [`TorrentMediaCache::open_playback`].
    pub fn with_reader_config(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn save_directory(&self, cache_id: &str) -> PathBuf {
        self.base_directory.join(cache_id)
    }

    /// Fetches torrent data, retrying transient failures.
    ///
    /// Unsupported sources fail on the first attempt.
    async fn fetch_with_retry(&self, uri: &str) -> Result<TorrentData, TorrentError> {
        let attempts = self.config.fetch_attempts.max(1);
        let timeout = self.config.fetch_timeout;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let fetch = self.downloader.fetch_torrent(uri, timeout);
            match tokio::time::timeout(timeout, fetch).await {
                Ok(Ok(data)) => return Ok(data),
                Ok(Err(e)) if e.is_permanent() => return Err(e),
                Ok(Err(e)) => {
                    warn!(attempt, attempts, uri, error = %e, "Torrent fetch failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(attempt, attempts, uri, ?timeout, "Torrent fetch timed out");
                    last_error = Some(TorrentError::FetchTimeout {
                        uri: uri.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TorrentError::FetchTimeout {
            uri: uri.to_string(),
        }))
    }

    async fn load_or_fetch(&self, uri: &str, save_directory: &Path) -> Result<TorrentData, TorrentError> {
        let path = save_directory.join(TORRENT_DATA_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => return Ok(TorrentData::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(uri, "Torrent data missing, fetching again");
        let data = self.fetch_with_retry(uri).await?;
        tokio::fs::create_dir_all(save_directory).await?;
        write_atomic(&path, &data.bytes).await?;
        Ok(data)
    }

    async fn open_cache(
        &self,
        cache_id: String,
        origin: Media,
        metadata: MediaCacheMetadata,
        data: &TorrentData,
        save_directory: PathBuf,
    ) -> Result<TorrentMediaCache, TorrentError> {
        let backend = self.downloader.start_session(data, &save_directory).await?;

        let opened = TorrentSession::open(Arc::clone(&backend)).and_then(|session| {
            let entry = select_episode_file(session.entries(), origin.file_hint.as_deref())
                .cloned()
                .ok_or(TorrentError::NoPlayableFile)?;
            let handle = entry.create_handle()?;
            Ok((session, entry, handle))
        });

        let (session, entry, handle) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(close_error) = backend.close().await {
                    warn!(cache_id, error = %close_error, "Failed to close session after open failure");
                }
                return Err(e);
            }
        };

        debug!(
            cache_id,
            file = entry.path_in_torrent(),
            size = entry.length(),
            "Selected episode file"
        );

        Ok(TorrentMediaCache::new(
            CacheParts {
                cache_id,
                origin,
                metadata,
                session,
                entry,
                handle,
                save_directory,
                reader_buffer_size: self.reader.buffer_size,
            },
            self.config.default_priority,
        ))
    }

    /// Fetches the torrent and creates a paused cache of the episode file.
    ///
    /// # Errors
    ///
    /// - `CacheError::Unsupported` - The media is not a torrent
    /// - `CacheError::Initialization` - Fetching or opening the torrent failed
    pub async fn create_torrent_cache(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<TorrentMediaCache, CacheError> {
        if !self.supports(&origin) {
            return Err(CacheError::Unsupported {
                media_id: origin.media_id,
            });
        }

        let cache_id = calculate_cache_id(&origin.media_id, &metadata);
        let save_directory = self.save_directory(&cache_id);
        let uri = origin.download.uri();

        let data = async {
            let data = self.fetch_with_retry(&uri).await?;
            tokio::fs::create_dir_all(&save_directory).await?;
            write_atomic(&save_directory.join(TORRENT_DATA_FILE), &data.bytes).await?;
            Ok::<_, TorrentError>(data)
        }
        .await
        .map_err(|e| initialization_error(&cache_id, &origin, e))?;

        let error_origin = origin.clone();
        let cache = self
            .open_cache(cache_id.clone(), origin, metadata, &data, save_directory)
            .await
            .map_err(|e| initialization_error(&cache_id, &error_origin, e))?;

        info!(cache_id, "Created torrent cache");
        Ok(cache)
    }
}

fn initialization_error(cache_id: &str, origin: &Media, source: TorrentError) -> CacheError {
    match source {
        TorrentError::Unsupported { .. } => CacheError::Unsupported {
            media_id: origin.media_id.clone(),
        },
        source => CacheError::Initialization {
            cache_id: cache_id.to_string(),
            source,
        },
    }
}

#[async_trait]
impl MediaCacheEngine for TorrentMediaCacheEngine {
    fn supports(&self, media: &Media) -> bool {
        media.download.is_torrent()
    }

    fn stats(&self) -> watch::Receiver<SessionStats> {
        self.downloader.total_stats()
    }

    async fn create_cache(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Arc<dyn MediaCache>, CacheError> {
        let cache = self.create_torrent_cache(origin, metadata).await?;
        Ok(Arc::new(cache))
    }

    async fn restore(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Option<Arc<dyn MediaCache>>, CacheError> {
        if !self.supports(&origin) {
            return Ok(None);
        }

        let cache_id = calculate_cache_id(&origin.media_id, &metadata);
        let save_directory = self.save_directory(&cache_id);
        let uri = origin.download.uri();

        let data = self
            .load_or_fetch(&uri, &save_directory)
            .await
            .map_err(|e| initialization_error(&cache_id, &origin, e))?;

        let error_origin = origin.clone();
        let cache = self
            .open_cache(cache_id.clone(), origin, metadata, &data, save_directory)
            .await
            .map_err(|e| initialization_error(&cache_id, &error_origin, e))?;

        debug!(cache_id, "Restored torrent cache");
        Ok(Some(Arc::new(cache)))
    }

    async fn delete_unused_caches(
        &self,
        known_cache_ids: &HashSet<String>,
    ) -> Result<(), CacheError> {

        let mut directory = match tokio::fs::read_dir(&self.base_directory).await {
            Ok(directory) => directory,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = directory.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if known_cache_ids.contains(&name) {
                continue;
            }

            info!(directory = %entry.path().display(), "Deleting unused torrent cache");
            if let Err(e) = remove_dir_if_exists(&entry.path()).await {
                warn!(directory = %entry.path().display(), error = %e, "Failed to delete unused cache");
            }
        }

        Ok(())
    }
}

struct CacheParts {
    cache_id: String,
    origin: Media,
    metadata: MediaCacheMetadata,
    session: TorrentSession,
    entry: Arc<TorrentFileEntry>,
    handle: TorrentFileHandle,
    save_directory: PathBuf,
    reader_buffer_size: usize,
}

struct CacheInner {
    parts: CacheParts,
    priority: FilePriority,
    state: watch::Sender<MediaCacheState>,
    file_stats: watch::Sender<FileStats>,
    closed: AtomicBool,
    deleted: AtomicBool,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheInner {
    fn refresh_file_stats(&self) {
        let stats = self.parts.entry.stats();
        self.file_stats.send_if_modified(|current| {
            if *current == stats {
                return false;
            }
            *current = stats;
            true
        });
    }

    async fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(task) = self.stats_task.lock().take() {
            task.abort();
        }

        let handle_result = self.parts.handle.close().await;
        // Readers may still hold handles; the cache owns the session.
        let session_result = self.parts.session.close().await;
        debug!(cache_id = self.parts.cache_id, "Closed torrent cache");

        handle_result.and(session_result).map_err(CacheError::from)
    }

    async fn close_and_delete_files(&self) -> Result<(), CacheError> {
        let close_result = self.close().await;
        let delete_result = remove_dir_if_exists(&self.parts.save_directory)
            .await
            .map_err(CacheError::from);

        info!(
            cache_id = self.parts.cache_id,
            directory = %self.parts.save_directory.display(),
            "Deleted torrent cache files"
        );
        close_result.and(delete_result)
    }
}

/// A cache of one file of a torrent.
///
/// The cache keeps one file handle open for its whole lifetime; pausing and
/// resuming change that handle's requested priority.
pub struct TorrentMediaCache {
    inner: Arc<CacheInner>,
}

impl TorrentMediaCache {
    fn new(parts: CacheParts, priority: FilePriority) -> Self {
        let initial_stats = parts.entry.stats();
        let mut session_stats = parts.session.stats();
        let (state, _) = watch::channel(MediaCacheState::Paused);
        let (file_stats, _) = watch::channel(initial_stats);

        let inner = Arc::new(CacheInner {
            parts,
            priority,
            state,
            file_stats,
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            stats_task: Mutex::new(None),
        });

        let weak: Weak<CacheInner> = Arc::downgrade(&inner);
        let task = tokio::spawn(async move {
            while session_stats.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.refresh_file_stats();
            }
        });
        *inner.stats_task.lock() = Some(task);

        Self { inner }
    }

    /// The torrent file this cache downloads.
    pub fn entry(&self) -> &Arc<TorrentFileEntry> {
        &self.inner.parts.entry
    }

    pub fn save_directory(&self) -> &Path {
        &self.inner.parts.save_directory
    }

    /// Opens the cached file for playback.
    ///
    /// The returned handle requests `FilePriority::High` until it is closed;
    /// the reader buffers according to the engine's `ReaderConfig`.
    ///
    /// # Errors
    ///
    /// - `CacheError::Deleted` - The cache files were removed
    /// - `CacheError::Torrent` - The session is closed or the file is not allocated yet
    pub fn open_playback(
        &self,
    ) -> Result<(TorrentFileHandle, TorrentInput<std::fs::File>), CacheError> {
        self.ensure_not_deleted()?;
        let handle = self.inner.parts.entry.create_handle()?;
        handle.resume(FilePriority::High)?;
        let input = handle.create_input(self.inner.parts.reader_buffer_size)?;
        Ok((handle, input))
    }

    fn ensure_not_deleted(&self) -> Result<(), CacheError> {
        if self.is_deleted() {
            return Err(CacheError::Deleted {
                cache_id: self.inner.parts.cache_id.clone(),
            });
        }
        Ok(())
    }

    fn is_actionable(&self) -> bool {
        !self.inner.deleted.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaCache for TorrentMediaCache {
    fn cache_id(&self) -> &str {
        &self.inner.parts.cache_id
    }

    fn origin(&self) -> &Media {
        &self.inner.parts.origin
    }

    fn metadata(&self) -> &MediaCacheMetadata {
        &self.inner.parts.metadata
    }

    fn state(&self) -> watch::Receiver<MediaCacheState> {
        self.inner.state.subscribe()
    }

    fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    fn file_stats(&self) -> watch::Receiver<FileStats> {
        self.inner.file_stats.subscribe()
    }

    fn session_stats(&self) -> watch::Receiver<SessionStats> {
        self.inner.parts.session.stats()
    }

    async fn cached_media(&self) -> Result<CachedMedia, CacheError> {
        self.ensure_not_deleted()?;
        Ok(CachedMedia {
            origin: self.inner.parts.origin.clone(),
            cache_id: self.inner.parts.cache_id.clone(),
            download: ResourceLocation::LocalFile {
                path: self.inner.parts.entry.file_path(),
            },
        })
    }

    async fn pause(&self) -> Result<(), CacheError> {
        if !self.is_actionable() {
            return Ok(());
        }
        match self.inner.parts.handle.pause() {
            Ok(()) | Err(TorrentError::HandleClosed) => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.state.send_replace(MediaCacheState::Paused);
        debug!(cache_id = self.cache_id(), "Paused cache");
        Ok(())
    }

    async fn resume(&self) -> Result<(), CacheError> {
        if !self.is_actionable() {
            return Ok(());
        }
        match self.inner.parts.handle.resume(self.inner.priority) {
            Ok(()) | Err(TorrentError::HandleClosed) => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.state.send_replace(MediaCacheState::InProgress);
        debug!(cache_id = self.cache_id(), "Resumed cache");
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.inner.close().await
    }

    async fn close_and_delete_files(&self) -> Result<(), CacheError> {
        if self.inner.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Cleanup runs in its own task so that dropping this future does not
        // leave the cache half deleted.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.close_and_delete_files().await })
            .await
            .map_err(|e| CacheError::Task {
                reason: e.to_string(),
            })?
    }
}
