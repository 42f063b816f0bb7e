//! Storage that keeps one metadata file per cache in a directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CachePredicate, MediaCacheSave, MediaCacheStorage, SaveDataStore, StorageError,
    UploadAccounting, list_metadata_files, metadata_path, read_save, write_save,
};
use crate::cache::{Media, MediaCache, MediaCacheEngine, MediaCacheMetadata, calculate_cache_id};
use crate::config::StorageConfig;
use crate::fs_util::remove_file_if_exists;
use crate::stats::SessionStats;

enum RestoreOutcome {
    Restored(Arc<dyn MediaCache>, PathBuf),
    /// The file stays for a later attempt and its engine files must survive.
    Kept { cache_id: String },
    /// The file could not be read, so its cache id is unknown.
    Unreadable,
    Discarded,
}

/// A storage rooted at one directory.
///
/// Every mutation of the cache list holds `list`; the metadata file is
/// written before a cache enters the list and removed before it leaves it.
pub struct DirectoryMediaCacheStorage {
    id: String,
    directory: PathBuf,
    engine: Arc<dyn MediaCacheEngine>,
    config: StorageConfig,
    list: Mutex<Vec<Arc<dyn MediaCache>>>,
    published: watch::Sender<Vec<Arc<dyn MediaCache>>>,
    save_data: SaveDataStore,
    accounting_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DirectoryMediaCacheStorage {
    /// Opens the storage, restoring every cache found in `directory`.
    ///
    /// Restored caches are resumed. Afterwards the engine is asked to delete
    /// artifacts that no restored cache refers to.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - The directory could not be created or listed
    pub async fn open(
        id: impl Into<String>,
        directory: impl Into<PathBuf>,
        engine: Arc<dyn MediaCacheEngine>,
        config: StorageConfig,
    ) -> Result<Arc<Self>, StorageError> {
        let id = id.into();
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let save_data = SaveDataStore::load(directory.join(&config.save_data_file)).await;
        let (published, _) = watch::channel(Vec::new());
        let storage = Arc::new(Self {
            id,
            directory,
            engine,
            config,
            list: Mutex::new(Vec::new()),
            published,
            save_data,
            accounting_task: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        storage.restore_all().await?;
        storage.start_upload_accounting();
        Ok(storage)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn engine(&self) -> &Arc<dyn MediaCacheEngine> {
        &self.engine
    }

    fn canonical_path(&self, cache_id: &str) -> PathBuf {
        metadata_path(&self.directory, cache_id, &self.config.metadata_extension)
    }

    fn publish(&self, list: &[Arc<dyn MediaCache>]) {
        self.published.send_replace(list.to_vec());
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed {
                storage_id: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn restore_all(&self) -> Result<(), StorageError> {
        let files = list_metadata_files(&self.directory, &self.config.metadata_extension).await?;
        let file_count = files.len();
        let limiter = Semaphore::new(self.config.restore_concurrency.max(1));

        let restores = files.into_iter().map(|path| {
            let limiter = &limiter;
            async move {
                let Ok(_permit) = limiter.acquire().await else {
                    return RestoreOutcome::Discarded;
                };
                self.restore_file(path).await
            }
        });
        let restored = join_all(restores).await;

        let mut list = self.list.lock().await;
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut pending = HashSet::new();
        let mut unreadable = 0;
        for outcome in restored {
            let (cache, path) = match outcome {
                RestoreOutcome::Restored(cache, path) => (cache, path),
                RestoreOutcome::Kept { cache_id } => {
                    pending.insert(cache_id);
                    continue;
                }
                RestoreOutcome::Unreadable => {
                    unreadable += 1;
                    continue;
                }
                RestoreOutcome::Discarded => continue,
            };
            if seen.insert(cache.cache_id().to_string()) {
                kept.push((cache, path));
                continue;
            }

            // Two files describing the same cache; keep the first one.
            warn!(cache_id = cache.cache_id(), path = %path.display(), "Dropping duplicate cache file");
            if let Err(e) = cache.close().await {
                warn!(cache_id = cache.cache_id(), error = %e, "Failed to close duplicate cache");
            }
            if let Err(e) = remove_file_if_exists(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove duplicate cache file");
            }
        }

        for (cache, path) in kept {
            self.migrate(cache.cache_id(), &path).await;
            list.push(cache);
        }
        self.publish(&list);

        info!(
            storage = self.id,
            restored = list.len(),
            files = file_count,
            "Restored media caches"
        );

        if unreadable > 0 {
            warn!(storage = self.id, unreadable, "Skipping unused cache cleanup");
            return Ok(());
        }

        let mut known_cache_ids = seen;
        known_cache_ids.extend(pending);
        if let Err(e) = self.engine.delete_unused_caches(&known_cache_ids).await {
            warn!(storage = self.id, error = %e, "Failed to delete unused caches");
        }
        Ok(())
    }

    /// Restores the cache saved in `path`.
    async fn restore_file(&self, path: PathBuf) -> RestoreOutcome {
        let save = match read_save(&path).await {
            Ok(save) => save,
            Err(StorageError::Serialization { source, .. }) => {
                warn!(path = %path.display(), error = %source, "Deleting corrupt cache file");
                if let Err(e) = remove_file_if_exists(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to delete corrupt cache file");
                }
                return RestoreOutcome::Discarded;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache file");
                return RestoreOutcome::Unreadable;
            }
        };

        let cache_id = calculate_cache_id(&save.origin.media_id, &save.metadata);
        let cache = match self.engine.restore(save.origin, save.metadata).await {
            Ok(Some(cache)) => cache,
            Ok(None) => {
                warn!(path = %path.display(), cache_id, "Engine cannot restore cache, keeping file");
                return RestoreOutcome::Kept { cache_id };
            }
            Err(e) => {
                warn!(path = %path.display(), cache_id, error = %e, "Failed to restore cache, keeping file");
                return RestoreOutcome::Kept { cache_id };
            }
        };

        if let Err(e) = cache.resume().await {
            warn!(cache_id = cache.cache_id(), error = %e, "Failed to resume restored cache");
        }

        debug!(cache_id = cache.cache_id(), "Restored cache");
        RestoreOutcome::Restored(cache, path)
    }

    /// Renames a metadata file to the canonical name for `cache_id`.
    async fn migrate(&self, cache_id: &str, path: &Path) {
        let canonical = self.canonical_path(cache_id);
        if path == canonical {
            return;
        }

        match tokio::fs::rename(path, &canonical).await {
            Ok(()) => info!(
                from = %path.display(),
                to = %canonical.display(),
                "Migrated cache file"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to migrate cache file"),
        }
    }

    fn start_upload_accounting(self: &Arc<Self>) {
        let storage: Weak<Self> = Arc::downgrade(self);
        let mut stats = self.engine.stats();
        let mut accounting = UploadAccounting::new(self.config.max_upload_delta_bytes);

        let task = tokio::spawn(async move {
            loop {
                let uploaded = stats.borrow_and_update().uploaded_bytes;
                let delta = accounting.observe(uploaded);
                if delta > 0 {
                    let Some(storage) = storage.upgrade() else {
                        break;
                    };
                    if let Err(e) = storage.save_data.add_uploaded(delta).await {
                        warn!(storage = storage.id, error = %e, "Failed to persist upload total");
                    }
                }
                if stats.changed().await.is_err() {
                    break;
                }
            }
        });
        *self.accounting_task.lock() = Some(task);
    }

    async fn delete_locked(
        &self,
        list: &mut Vec<Arc<dyn MediaCache>>,
        position: usize,
    ) -> Result<(), StorageError> {
        let cache = Arc::clone(&list[position]);
        remove_file_if_exists(&self.canonical_path(cache.cache_id())).await?;

        let delete_result = cache.close_and_delete_files().await;
        list.remove(position);
        self.publish(list);

        info!(storage = self.id, cache_id = cache.cache_id(), "Deleted cache");
        delete_result.map_err(StorageError::from)
    }
}

#[async_trait]
impl MediaCacheStorage for DirectoryMediaCacheStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, media: &Media) -> bool {
        self.engine.supports(media)
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Arc<dyn MediaCache>>> {
        self.published.subscribe()
    }

    fn stats(&self) -> watch::Receiver<SessionStats> {
        self.engine.stats()
    }

    fn total_uploaded_bytes(&self) -> u64 {
        self.save_data.get().total_uploaded_bytes
    }

    async fn cache(
        &self,
        media: Media,
        metadata: MediaCacheMetadata,
        resume: bool,
    ) -> Result<Arc<dyn MediaCache>, StorageError> {
        self.ensure_open()?;
        if !self.engine.supports(&media) {
            return Err(StorageError::UnsupportedMedia {
                storage_id: self.id.clone(),
                media_id: media.media_id,
            });
        }

        let mut list = self.list.lock().await;
        let existing = list.iter().find(|cache| {
            cache.origin().media_id == media.media_id
                && cache
                    .metadata()
                    .is_episode(&metadata.subject_id, &metadata.episode_id)
        });
        if let Some(existing) = existing.cloned() {
            debug!(cache_id = existing.cache_id(), "Cache already exists");
            if resume {
                existing.resume().await?;
            }
            return Ok(existing);
        }

        let save = MediaCacheSave {
            origin: media.clone(),
            metadata: metadata.clone(),
        };
        let cache = self.engine.create_cache(media, metadata).await?;

        let path = self.canonical_path(cache.cache_id());
        if let Err(e) = write_save(&path, &save).await {
            if let Err(cleanup) = cache.close_and_delete_files().await {
                warn!(cache_id = cache.cache_id(), error = %cleanup, "Failed to discard cache");
            }
            return Err(e);
        }

        list.push(Arc::clone(&cache));
        self.publish(&list);
        drop(list);

        info!(storage = self.id, cache_id = cache.cache_id(), "Created cache");
        if resume {
            cache.resume().await?;
        }
        Ok(cache)
    }

    async fn delete(&self, cache_id: &str) -> Result<bool, StorageError> {
        let mut list = self.list.lock().await;
        let Some(position) = list.iter().position(|cache| cache.cache_id() == cache_id) else {
            return Ok(false);
        };
        self.delete_locked(&mut list, position).await?;
        Ok(true)
    }

    async fn delete_first(&self, predicate: CachePredicate<'_>) -> Result<bool, StorageError> {
        let mut list = self.list.lock().await;
        let Some(position) = list.iter().position(|cache| predicate(cache.as_ref())) else {
            return Ok(false);
        };
        self.delete_locked(&mut list, position).await?;
        Ok(true)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.accounting_task.lock().take() {
            task.abort();
        }

        let caches = self.list.lock().await.clone();
        let results = join_all(caches.iter().map(|cache| cache.close())).await;

        let mut first_error = None;
        for (cache, result) in caches.iter().zip(results) {
            if let Err(e) = result {
                warn!(cache_id = cache.cache_id(), error = %e, "Failed to close cache");
                first_error.get_or_insert(e);
            }
        }

        debug!(storage = self.id, "Closed storage");
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl Drop for DirectoryMediaCacheStorage {
    fn drop(&mut self) {
        if let Some(task) = self.accounting_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{MediaCacheState, calculate_cache_id};
    use crate::stats::SessionStats;
    use crate::test_utils::{TestMediaCacheEngine, magnet_media, sample_metadata};

    async fn open(dir: &Path, engine: &Arc<TestMediaCacheEngine>) -> Arc<DirectoryMediaCacheStorage> {
        DirectoryMediaCacheStorage::open(
            "local",
            dir,
            Arc::clone(engine) as Arc<dyn MediaCacheEngine>,
            StorageConfig::default(),
        )
        .await
        .unwrap()
    }

    fn write_raw_save(dir: &Path, file_name: &str, media_id: &str, episode_id: &str) {
        let save = MediaCacheSave {
            origin: magnet_media(media_id, "magnet:?xt=urn:btih:one"),
            metadata: sample_metadata("1", episode_id),
        };
        std::fs::write(dir.join(file_name), serde_json::to_vec(&save).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_cache_writes_metadata_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let mut list = storage.subscribe();

        let cache = storage
            .cache(magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"), sample_metadata("1", "10"), true)
            .await
            .unwrap();

        assert!(list.has_changed().unwrap());
        assert_eq!(list.borrow_and_update().len(), 1);
        assert_eq!(*cache.state().borrow(), MediaCacheState::InProgress);

        let save = read_save(&dir.path().join(format!("{}.metadata", cache.cache_id())))
            .await
            .unwrap();
        assert_eq!(save.origin.media_id, "dmhy.1");
        assert_eq!(save.metadata.episode_id, "10");
    }

    #[tokio::test]
    async fn test_cache_returns_existing_for_same_episode() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");

        let first = storage
            .cache(media.clone(), sample_metadata("1", "10"), false)
            .await
            .unwrap();
        let second = storage
            .cache(media, sample_metadata("1", "10"), true)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.caches().len(), 1);
        assert_eq!(engine.created_count(), 1);
        assert_eq!(*first.state().borrow(), MediaCacheState::InProgress);
    }

    #[tokio::test]
    async fn test_unsupported_media_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let media = Media::new(
            "web.1",
            "web",
            crate::cache::ResourceLocation::WebVideo {
                uri: "https://example.com/1.m3u8".to_string(),
            },
        );

        let result = storage.cache(media, sample_metadata("1", "10"), true).await;

        assert!(matches!(result, Err(StorageError::UnsupportedMedia { .. })));
        assert!(storage.caches().is_empty());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");
        let metadata = sample_metadata("1", "10");
        let created = storage.cache(media.clone(), metadata.clone(), false).await.unwrap();
        let cache_id = created.cache_id().to_string();
        storage.close().await.unwrap();
        drop(storage);

        let engine = TestMediaCacheEngine::new();
        let reopened = open(dir.path(), &engine).await;

        let caches = reopened.caches();
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].cache_id(), cache_id);
        assert_eq!(caches[0].origin(), &media);
        assert_eq!(caches[0].metadata(), &metadata);
        assert_eq!(*caches[0].state().borrow(), MediaCacheState::InProgress);
        assert_eq!(engine.unused_deletions(), vec![vec![cache_id]]);
    }

    #[tokio::test]
    async fn test_restore_discards_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.metadata"), b"{\"origin\": 3").unwrap();
        let media_id = "dmhy.1";
        let cache_id = calculate_cache_id(media_id, &sample_metadata("1", "10"));
        write_raw_save(dir.path(), &format!("{cache_id}.metadata"), media_id, "10");

        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;

        assert_eq!(storage.caches().len(), 1);
        assert!(!dir.path().join("broken.metadata").exists());
    }

    #[tokio::test]
    async fn test_restore_migrates_legacy_file_names() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_save(dir.path(), "legacy-name.metadata", "dmhy.1", "10");

        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;

        let cache_id = storage.caches()[0].cache_id().to_string();
        assert!(!dir.path().join("legacy-name.metadata").exists());
        assert!(dir.path().join(format!("{cache_id}.metadata")).exists());
    }

    #[tokio::test]
    async fn test_restore_drops_duplicate_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache_id = calculate_cache_id("dmhy.1", &sample_metadata("1", "10"));
        write_raw_save(dir.path(), &format!("{cache_id}.metadata"), "dmhy.1", "10");
        write_raw_save(dir.path(), "zz-copy.metadata", "dmhy.1", "10");

        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;

        assert_eq!(storage.caches().len(), 1);
        assert_eq!(list_metadata_files(dir.path(), "metadata").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        write_raw_save(dir.path(), "cache.metadata", "dmhy.1", "10");
        let engine = TestMediaCacheEngine::new();
        engine.set_restore_fails(true);

        let storage = open(dir.path(), &engine).await;

        assert!(storage.caches().is_empty());
        assert!(dir.path().join("cache.metadata").exists());
        // The engine must keep the files of the cache that is still saved.
        let cache_id = calculate_cache_id("dmhy.1", &sample_metadata("1", "10"));
        assert_eq!(engine.unused_deletions(), vec![vec![cache_id]]);
    }

    #[tokio::test]
    async fn test_restore_concurrency_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        for episode in 0..20 {
            write_raw_save(
                dir.path(),
                &format!("cache-{episode}.metadata"),
                "dmhy.1",
                &episode.to_string(),
            );
        }
        let engine = TestMediaCacheEngine::new();
        engine.set_restore_delay(Duration::from_millis(10));

        let storage = DirectoryMediaCacheStorage::open(
            "local",
            dir.path(),
            Arc::clone(&engine) as Arc<dyn MediaCacheEngine>,
            StorageConfig {
                restore_concurrency: 4,
                ..StorageConfig::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(storage.caches().len(), 20);
        assert!(engine.max_concurrent_restores() <= 4);
        assert!(engine.max_concurrent_restores() >= 2);
    }

    #[tokio::test]
    async fn test_delete_removes_file_then_cache() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let cache = storage
            .cache(magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"), sample_metadata("1", "10"), false)
            .await
            .unwrap();
        let path = dir.path().join(format!("{}.metadata", cache.cache_id()));

        assert!(storage.delete(cache.cache_id()).await.unwrap());
        assert!(!storage.delete(cache.cache_id()).await.unwrap());

        assert!(!path.exists());
        assert!(cache.is_deleted());
        assert!(storage.caches().is_empty());
        assert!(storage.find(cache.cache_id()).is_none());
    }

    #[tokio::test]
    async fn test_delete_first_matches_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");
        storage.cache(media.clone(), sample_metadata("1", "10"), false).await.unwrap();
        storage.cache(media, sample_metadata("1", "11"), false).await.unwrap();

        let deleted = storage
            .delete_first(&|cache: &dyn MediaCache| cache.metadata().episode_id == "11")
            .await
            .unwrap();
        let missing = storage
            .delete_first(&|cache: &dyn MediaCache| cache.metadata().episode_id == "12")
            .await
            .unwrap();

        assert!(deleted);
        assert!(!missing);
        let remaining = storage.caches();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata().episode_id, "10");
    }

    #[tokio::test]
    async fn test_upload_accounting_persists_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;

        engine.publish_stats(SessionStats::new(None, 0, 1_000, 0, 0));
        tokio::time::timeout(Duration::from_secs(1), async {
            while storage.total_uploaded_bytes() != 1_000 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.publish_stats(SessionStats::new(None, 0, 1_500, 0, 0));
        tokio::time::timeout(Duration::from_secs(1), async {
            while storage.total_uploaded_bytes() != 1_500 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let persisted = SaveDataStore::load(dir.path().join("storage-data.json")).await;
        assert_eq!(persisted.get().total_uploaded_bytes, 1_500);
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_new_caches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let storage = open(dir.path(), &engine).await;
        let cache = storage
            .cache(magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"), sample_metadata("1", "10"), false)
            .await
            .unwrap();

        storage.close().await.unwrap();
        storage.close().await.unwrap();

        assert_eq!(engine.closed_count(), 1);
        assert!(!cache.is_deleted());
        let result = storage
            .cache(magnet_media("dmhy.2", "magnet:?xt=urn:btih:two"), sample_metadata("1", "11"), false)
            .await;
        assert!(matches!(result, Err(StorageError::Closed { .. })));
    }
}
