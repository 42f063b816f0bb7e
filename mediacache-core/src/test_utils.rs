//! In-memory doubles of the external collaborators, for unit and
//! integration tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::watch;

use crate::cache::{
    CacheError, CachedMedia, EpisodeSort, Media, MediaCache, MediaCacheEngine,
    MediaCacheMetadata, MediaCacheState, ResourceLocation, calculate_cache_id,
};
use crate::request::{
    CacheRequestError, EpisodeCacheRequest, MediaFetchSession, MediaSelector, MediaSourceFetcher,
};
use crate::stats::{FileStats, Progress, SessionStats};
use crate::torrent::{
    FilePriority, Piece, PieceState, TorrentData, TorrentDownloader, TorrentError,
    TorrentFileInfo, TorrentSessionBackend,
};

const SAMPLE_TEXT: &str = "Lorem Ipsum is simply dummy text of the printing and typesetting \
industry. Lorem Ipsum has been the industry's standard dummy text ever since the 1500s, when an \
unknown printer took a galley of type and scrambled it to make a type specimen book. It has \
survived not only five centuries, but also the leap into electronic typesetting, remaining \
essentially unchanged. It was popularised in the 1960s with the release of Letraset sheets \
containing Lorem Ipsum passages, and more recently with desktop publishing software like Aldus \
PageMaker including versions of Lorem Ipsum.\n\n";

/// 576 bytes of text, 36 pieces of 16 bytes.
pub fn sample_text() -> Vec<u8> {
    SAMPLE_TEXT.as_bytes().to_vec()
}

/// Deterministic file contents for mock torrents.
pub fn pattern_bytes(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn magnet_media(media_id: &str, uri: &str) -> Media {
    Media::new(
        media_id,
        "dmhy",
        ResourceLocation::MagnetLink {
            uri: uri.to_string(),
        },
    )
    .with_title(format!("[Group] Frieren - {media_id}"))
}

pub fn sample_metadata(subject_id: &str, episode_id: &str) -> MediaCacheMetadata {
    MediaCacheMetadata::new(subject_id, episode_id, EpisodeSort::new(episode_id))
        .with_subject_names(vec!["Frieren".to_string()])
}

pub fn sample_request(subject_id: &str, episode_id: &str) -> EpisodeCacheRequest {
    EpisodeCacheRequest::new(subject_id, episode_id, EpisodeSort::new(episode_id))
        .with_subject_names(vec!["Frieren".to_string()])
}

/// Torrent session whose files are real files in a directory and whose
/// pieces are driven by the test.
pub struct MockSessionBackend {
    files: Vec<TorrentFileInfo>,
    pieces: Vec<Arc<Piece>>,
    total_size: u64,
    save_directory: PathBuf,
    priorities: Mutex<HashMap<usize, FilePriority>>,
    stats: watch::Sender<SessionStats>,
    close_delay: Mutex<Duration>,
    close_count: AtomicUsize,
    _temp_dir: Option<TempDir>,
}

impl MockSessionBackend {
    /// Lays `files` out back to back and writes them into `save_directory`.
    pub fn create(
        save_directory: &Path,
        files: &[(&str, u64)],
        piece_size: u64,
    ) -> std::io::Result<Arc<Self>> {
        Self::build(save_directory.to_path_buf(), files, piece_size, None)
    }

    pub fn single_file(name: &str, length: u64, piece_size: u64) -> Arc<Self> {
        Self::multi_file(&[(name, length)], piece_size)
    }

    pub fn multi_file(files: &[(&str, u64)], piece_size: u64) -> Arc<Self> {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let directory = temp_dir.path().to_path_buf();
        Self::build(directory, files, piece_size, Some(temp_dir)).expect("write mock files")
    }

    fn build(
        save_directory: PathBuf,
        files: &[(&str, u64)],
        piece_size: u64,
        temp_dir: Option<TempDir>,
    ) -> std::io::Result<Arc<Self>> {
        let mut infos = Vec::with_capacity(files.len());
        let mut offset = 0;
        for (index, (name, length)) in files.iter().enumerate() {
            let path = save_directory.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, pattern_bytes(*length))?;
            infos.push(TorrentFileInfo {
                index,
                path_in_torrent: name.to_string(),
                offset_in_torrent: offset,
                length: *length,
            });
            offset += length;
        }

        let (stats, _) = watch::channel(SessionStats::new(Some(offset), 0, 0, 0, 0));
        Ok(Arc::new(Self {
            files: infos,
            pieces: Piece::build_pieces(offset, piece_size, 0),
            total_size: offset,
            save_directory,
            priorities: Mutex::new(HashMap::new()),
            stats,
            close_delay: Mutex::new(Duration::ZERO),
            close_count: AtomicUsize::new(0),
            _temp_dir: temp_dir,
        }))
    }

    pub fn file_priority(&self, file_index: usize) -> FilePriority {
        self.priorities
            .lock()
            .get(&file_index)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    pub fn set_piece_state(&self, index: usize, state: PieceState) {
        self.pieces[index].set_state(state);
        self.refresh_stats();
    }

    pub fn finish_all(&self) {
        for piece in &self.pieces {
            piece.set_state(PieceState::Finished);
        }
        self.refresh_stats();
    }

    /// Sets the session's running upload counter.
    pub fn set_uploaded(&self, uploaded_bytes: u64) {
        self.stats.send_modify(|stats| stats.uploaded_bytes = uploaded_bytes);
    }

    fn refresh_stats(&self) {
        let downloaded = self
            .pieces
            .iter()
            .filter(|piece| piece.is_finished())
            .map(|piece| piece.size())
            .sum::<u64>()
            .min(self.total_size);
        self.stats.send_modify(|stats| {
            *stats = SessionStats::new(
                Some(self.total_size),
                downloaded,
                stats.uploaded_bytes,
                stats.download_speed,
                stats.upload_speed,
            );
        });
    }
}

#[async_trait]
impl TorrentSessionBackend for MockSessionBackend {
    fn files(&self) -> Vec<TorrentFileInfo> {
        self.files.clone()
    }

    fn pieces(&self) -> Vec<Arc<Piece>> {
        self.pieces.clone()
    }

    fn save_directory(&self) -> PathBuf {
        self.save_directory.clone()
    }

    fn file_path(&self, file_index: usize) -> PathBuf {
        self.save_directory
            .join(&self.files[file_index].path_in_torrent)
    }

    fn set_file_priority(&self, file_index: usize, priority: FilePriority) {
        self.priorities.lock().insert(file_index, priority);
    }

    fn stats(&self) -> watch::Receiver<SessionStats> {
        self.stats.subscribe()
    }

    async fn close(&self) -> Result<(), TorrentError> {
        let delay = *self.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.close_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockTorrent {
    files: Vec<(String, u64)>,
    piece_size: u64,
}

/// Downloader serving torrents registered by the test.
///
/// Torrent data is the JSON of the registered layout. Only `magnet:` and
/// `http` URIs are supported.
pub struct MockTorrentDownloader {
    torrents: Mutex<HashMap<String, MockTorrent>>,
    failures_remaining: AtomicU32,
    fetch_attempts: AtomicU32,
    sessions: Mutex<Vec<Arc<MockSessionBackend>>>,
    total_stats: watch::Sender<SessionStats>,
}

impl MockTorrentDownloader {
    pub fn new() -> Arc<Self> {
        let (total_stats, _) = watch::channel(SessionStats::default());
        Arc::new(Self {
            torrents: Mutex::new(HashMap::new()),
            failures_remaining: AtomicU32::new(0),
            fetch_attempts: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
            total_stats,
        })
    }

    pub fn add_torrent(&self, uri: &str, files: &[(&str, u64)], piece_size: u64) {
        let torrent = MockTorrent {
            files: files
                .iter()
                .map(|(name, length)| (name.to_string(), *length))
                .collect(),
            piece_size,
        };
        self.torrents.lock().insert(uri.to_string(), torrent);
    }

    /// Makes the next `count` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Release);
    }

    pub fn fetch_attempts(&self) -> u32 {
        self.fetch_attempts.load(Ordering::Acquire)
    }

    pub fn last_session(&self) -> Option<Arc<MockSessionBackend>> {
        self.sessions.lock().last().cloned()
    }

    pub fn publish_total_stats(&self, stats: SessionStats) {
        self.total_stats.send_replace(stats);
    }
}

#[async_trait]
impl TorrentDownloader for MockTorrentDownloader {
    async fn fetch_torrent(&self, uri: &str, _timeout: Duration) -> Result<TorrentData, TorrentError> {
        self.fetch_attempts.fetch_add(1, Ordering::AcqRel);

        if !(uri.starts_with("magnet:") || uri.starts_with("http")) {
            return Err(TorrentError::Unsupported {
                reason: format!("unsupported uri scheme: {uri}"),
            });
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TorrentError::Downloader {
                reason: "simulated fetch failure".to_string(),
            });
        }

        let torrent = self
            .torrents
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| TorrentError::Downloader {
                reason: format!("no peers for {uri}"),
            })?;
        let bytes = serde_json::to_vec(&torrent).map_err(|e| TorrentError::Downloader {
            reason: e.to_string(),
        })?;
        Ok(TorrentData::new(bytes))
    }

    async fn start_session(
        &self,
        data: &TorrentData,
        save_directory: &Path,
    ) -> Result<Arc<dyn TorrentSessionBackend>, TorrentError> {
        let torrent: MockTorrent =
            serde_json::from_slice(&data.bytes).map_err(|e| TorrentError::CorruptLayout {
                reason: format!("invalid torrent data: {e}"),
            })?;
        let files: Vec<(&str, u64)> = torrent
            .files
            .iter()
            .map(|(name, length)| (name.as_str(), *length))
            .collect();

        let backend = MockSessionBackend::create(save_directory, &files, torrent.piece_size)?;
        self.sessions.lock().push(Arc::clone(&backend));
        Ok(backend)
    }

    fn total_stats(&self) -> watch::Receiver<SessionStats> {
        self.total_stats.subscribe()
    }
}

/// Cache whose progress is driven by the test.
pub struct TestMediaCache {
    cache_id: String,
    origin: Media,
    metadata: MediaCacheMetadata,
    state: watch::Sender<MediaCacheState>,
    file_stats: watch::Sender<FileStats>,
    session_stats: watch::Sender<SessionStats>,
    deleted: AtomicBool,
    closed: AtomicBool,
    close_fails: AtomicBool,
    closed_counter: Arc<AtomicUsize>,
}

impl TestMediaCache {
    fn new(origin: Media, metadata: MediaCacheMetadata, closed_counter: Arc<AtomicUsize>) -> Self {
        Self {
            cache_id: calculate_cache_id(&origin.media_id, &metadata),
            origin,
            metadata,
            state: watch::channel(MediaCacheState::Paused).0,
            file_stats: watch::channel(FileStats::default()).0,
            session_stats: watch::channel(SessionStats::default()).0,
            deleted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_fails: AtomicBool::new(false),
            closed_counter,
        }
    }

    pub fn set_file_stats(&self, stats: FileStats) {
        self.file_stats.send_replace(stats);
    }

    pub fn set_close_fails(&self, fails: bool) {
        self.close_fails.store(fails, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_actionable(&self) -> bool {
        !self.deleted.load(Ordering::Acquire) && !self.is_closed()
    }
}

#[async_trait]
impl MediaCache for TestMediaCache {
    fn cache_id(&self) -> &str {
        &self.cache_id
    }

    fn origin(&self) -> &Media {
        &self.origin
    }

    fn metadata(&self) -> &MediaCacheMetadata {
        &self.metadata
    }

    fn state(&self) -> watch::Receiver<MediaCacheState> {
        self.state.subscribe()
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn file_stats(&self) -> watch::Receiver<FileStats> {
        self.file_stats.subscribe()
    }

    fn session_stats(&self) -> watch::Receiver<SessionStats> {
        self.session_stats.subscribe()
    }

    async fn cached_media(&self) -> Result<CachedMedia, CacheError> {
        if self.is_deleted() {
            return Err(CacheError::Deleted {
                cache_id: self.cache_id.clone(),
            });
        }
        Ok(CachedMedia {
            origin: self.origin.clone(),
            cache_id: self.cache_id.clone(),
            download: ResourceLocation::LocalFile {
                path: PathBuf::from(&self.cache_id),
            },
        })
    }

    async fn pause(&self) -> Result<(), CacheError> {
        if self.is_actionable() {
            self.state.send_replace(MediaCacheState::Paused);
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), CacheError> {
        if self.is_actionable() {
            self.state.send_replace(MediaCacheState::InProgress);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        if self.close_fails.load(Ordering::Acquire) {
            return Err(CacheError::Task {
                reason: "simulated close failure".to_string(),
            });
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closed_counter.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn close_and_delete_files(&self) -> Result<(), CacheError> {
        self.deleted.store(true, Ordering::Release);
        self.close().await
    }
}

/// Engine creating [`TestMediaCache`]s for torrent media.
pub struct TestMediaCacheEngine {
    created: Mutex<Vec<Arc<TestMediaCache>>>,
    create_calls: AtomicUsize,
    restore_fails: AtomicBool,
    restore_delay: Mutex<Duration>,
    active_restores: AtomicUsize,
    max_concurrent_restores: AtomicUsize,
    unused_deletions: Mutex<Vec<Vec<String>>>,
    stats: watch::Sender<SessionStats>,
    closed: Arc<AtomicUsize>,
}

impl TestMediaCacheEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            restore_fails: AtomicBool::new(false),
            restore_delay: Mutex::new(Duration::ZERO),
            active_restores: AtomicUsize::new(0),
            max_concurrent_restores: AtomicUsize::new(0),
            unused_deletions: Mutex::new(Vec::new()),
            stats: watch::channel(SessionStats::default()).0,
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Every cache created or restored, in order.
    pub fn created(&self) -> Vec<Arc<TestMediaCache>> {
        self.created.lock().clone()
    }

    pub fn last_created(&self) -> Option<Arc<TestMediaCache>> {
        self.created.lock().last().cloned()
    }

    /// Number of `create_cache` calls.
    pub fn created_count(&self) -> usize {
        self.create_calls.load(Ordering::Acquire)
    }

    /// Number of caches closed successfully.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_restore_fails(&self, fails: bool) {
        self.restore_fails.store(fails, Ordering::Release);
    }

    pub fn set_restore_delay(&self, delay: Duration) {
        *self.restore_delay.lock() = delay;
    }

    pub fn max_concurrent_restores(&self) -> usize {
        self.max_concurrent_restores.load(Ordering::Acquire)
    }

    /// Sorted known cache ids passed to each `delete_unused_caches` call.
    pub fn unused_deletions(&self) -> Vec<Vec<String>> {
        self.unused_deletions.lock().clone()
    }

    pub fn publish_stats(&self, stats: SessionStats) {
        self.stats.send_replace(stats);
    }

    fn new_cache(&self, origin: Media, metadata: MediaCacheMetadata) -> Arc<TestMediaCache> {
        let cache = Arc::new(TestMediaCache::new(origin, metadata, Arc::clone(&self.closed)));
        self.created.lock().push(Arc::clone(&cache));
        cache
    }
}

#[async_trait]
impl MediaCacheEngine for TestMediaCacheEngine {
    fn supports(&self, media: &Media) -> bool {
        media.download.is_torrent()
    }

    fn stats(&self) -> watch::Receiver<SessionStats> {
        self.stats.subscribe()
    }

    async fn create_cache(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Arc<dyn MediaCache>, CacheError> {
        if !self.supports(&origin) {
            return Err(CacheError::Unsupported {
                media_id: origin.media_id,
            });
        }
        self.create_calls.fetch_add(1, Ordering::AcqRel);
        Ok(self.new_cache(origin, metadata))
    }

    async fn restore(
        &self,
        origin: Media,
        metadata: MediaCacheMetadata,
    ) -> Result<Option<Arc<dyn MediaCache>>, CacheError> {
        if !self.supports(&origin) {
            return Ok(None);
        }

        let active = self.active_restores.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_restores.fetch_max(active, Ordering::AcqRel);
        let delay = *self.restore_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active_restores.fetch_sub(1, Ordering::AcqRel);

        if self.restore_fails.load(Ordering::Acquire) {
            return Err(CacheError::Initialization {
                cache_id: calculate_cache_id(&origin.media_id, &metadata),
                source: TorrentError::Downloader {
                    reason: "simulated restore failure".to_string(),
                },
            });
        }
        Ok(Some(self.new_cache(origin, metadata)))
    }

    async fn delete_unused_caches(
        &self,
        known_cache_ids: &HashSet<String>,
    ) -> Result<(), CacheError> {
        let mut known: Vec<String> = known_cache_ids.iter().cloned().collect();
        known.sort();
        self.unused_deletions.lock().push(known);
        Ok(())
    }
}

/// Media search that reports a fixed candidate list.
pub struct TestFetchSession {
    results: watch::Sender<Vec<Media>>,
    progress: watch::Sender<Progress>,
    closed: AtomicBool,
}

impl TestFetchSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaFetchSession for TestFetchSession {
    fn results(&self) -> watch::Receiver<Vec<Media>> {
        self.results.subscribe()
    }

    fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct TestMediaSelector {
    candidates: Vec<Media>,
    preferred: Option<String>,
    selected: Mutex<Option<Media>>,
}

impl MediaSelector for TestMediaSelector {
    fn candidates(&self) -> Vec<Media> {
        self.candidates.clone()
    }

    fn selected(&self) -> Option<Media> {
        self.selected.lock().clone()
    }

    fn select(&self, media: &Media) -> bool {
        let known = self
            .candidates
            .iter()
            .any(|candidate| candidate.media_id == media.media_id);
        if known {
            *self.selected.lock() = Some(media.clone());
        }
        known
    }

    fn unselect(&self) {
        *self.selected.lock() = None;
    }

    fn preferred(&self) -> Option<Media> {
        let preferred = self.preferred.as_ref()?;
        self.candidates
            .iter()
            .find(|media| &media.media_id == preferred)
            .cloned()
    }
}

/// Fetcher handing out finished searches over `candidates`.
pub struct TestMediaFetcher {
    candidates: Vec<Media>,
    preferred: Mutex<Option<String>>,
    sessions: Mutex<Vec<Arc<TestFetchSession>>>,
    selectors: Mutex<Vec<Arc<TestMediaSelector>>>,
    fails: AtomicBool,
}

impl TestMediaFetcher {
    pub fn new(candidates: Vec<Media>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            preferred: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            selectors: Mutex::new(Vec::new()),
            fails: AtomicBool::new(false),
        })
    }

    pub fn set_preferred(&self, media_id: Option<&str>) {
        *self.preferred.lock() = media_id.map(str::to_string);
    }

    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::Release);
    }

    pub fn sessions(&self) -> Vec<Arc<TestFetchSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_selector(&self) -> Option<Arc<TestMediaSelector>> {
        self.selectors.lock().last().cloned()
    }
}

#[async_trait]
impl MediaSourceFetcher for TestMediaFetcher {
    async fn start_session(
        &self,
        _request: &EpisodeCacheRequest,
    ) -> Result<(Arc<dyn MediaFetchSession>, Arc<dyn MediaSelector>), CacheRequestError> {
        if self.fails.load(Ordering::Acquire) {
            return Err(CacheRequestError::Fetch {
                reason: "all sources failed".to_string(),
            });
        }

        let session = Arc::new(TestFetchSession {
            results: watch::channel(self.candidates.clone()).0,
            progress: watch::channel(Progress::COMPLETED).0,
            closed: AtomicBool::new(false),
        });
        let selector = Arc::new(TestMediaSelector {
            candidates: self.candidates.clone(),
            preferred: self.preferred.lock().clone(),
            selected: Mutex::new(None),
        });
        self.sessions.lock().push(Arc::clone(&session));
        self.selectors.lock().push(Arc::clone(&selector));
        Ok((session, selector))
    }
}
