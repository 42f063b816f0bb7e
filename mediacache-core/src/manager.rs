//! Root object aggregating every cache storage of the application.

use std::sync::Arc;

use futures::future::{join_all, pending, select_all};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::MediaCache;
use crate::stats::{FileStats, Progress};
use crate::storage::{CachePredicate, MediaCacheStorage, StorageError};

/// Cache state of one episode across all storages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EpisodeCacheStatus {
    Cached {
        total_size: Option<u64>,
    },
    Caching {
        progress: Progress,
        total_size: Option<u64>,
    },
    NotCached,
}

/// Derives an episode's status from the file stats of its caches.
///
/// A finished cache wins over unfinished ones; among unfinished caches the
/// one with the most progress is reported.
pub fn episode_cache_status(stats: &[FileStats]) -> EpisodeCacheStatus {
    if let Some(finished) = stats.iter().find(|stats| stats.is_finished()) {
        return EpisodeCacheStatus::Cached {
            total_size: finished.total_size,
        };
    }

    stats
        .iter()
        .max_by(|a, b| {
            let a = a.progress.value().unwrap_or(-1.0);
            let b = b.progress.value().unwrap_or(-1.0);
            a.total_cmp(&b)
        })
        .map_or(EpisodeCacheStatus::NotCached, |stats| {
            EpisodeCacheStatus::Caching {
                progress: stats.progress,
                total_size: stats.total_size,
            }
        })
}

fn matching_caches(
    caches: &[Arc<dyn MediaCache>],
    subject_id: &str,
    episode_id: &str,
) -> Vec<Arc<dyn MediaCache>> {
    caches
        .iter()
        .filter(|cache| !cache.is_deleted() && cache.metadata().is_episode(subject_id, episode_id))
        .cloned()
        .collect()
}

/// Holds the storages for the lifetime of the application.
pub struct MediaCacheManager {
    storages: Vec<Arc<dyn MediaCacheStorage>>,
    caches: watch::Sender<Vec<Arc<dyn MediaCache>>>,
    aggregator: Option<JoinHandle<()>>,
}

impl MediaCacheManager {
    /// Creates the manager. Must be called inside a tokio runtime when
    /// `storages` is not empty.
    pub fn new(storages: Vec<Arc<dyn MediaCacheStorage>>) -> Self {
        let receivers: Vec<_> = storages.iter().map(|storage| storage.subscribe()).collect();
        let (caches, _) = watch::channel(concat_lists(&receivers));

        let aggregator = (!receivers.is_empty()).then(|| {
            let sender = caches.clone();
            tokio::spawn(aggregate_lists(receivers, sender))
        });

        Self {
            storages,
            caches,
            aggregator,
        }
    }

    pub fn storages(&self) -> &[Arc<dyn MediaCacheStorage>] {
        &self.storages
    }

    pub fn storage(&self, id: &str) -> Option<&Arc<dyn MediaCacheStorage>> {
        self.storages.iter().find(|storage| storage.id() == id)
    }

    /// Live list of the caches of every storage, in storage order.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Arc<dyn MediaCache>>> {
        self.caches.subscribe()
    }

    pub fn all_caches(&self) -> Vec<Arc<dyn MediaCache>> {
        self.storages
            .iter()
            .flat_map(|storage| storage.caches())
            .collect()
    }

    /// First live cache of an episode in any storage.
    pub fn find_existing_cache(
        &self,
        subject_id: &str,
        episode_id: &str,
    ) -> Option<Arc<dyn MediaCache>> {
        matching_caches(&self.all_caches(), subject_id, episode_id)
            .into_iter()
            .next()
    }

    /// Continuously derived cache status of one episode.
    ///
    /// Whenever the set of caches changes, the stats of the previous set are
    /// dropped and the status is derived from the new set only. The
    /// derivation stops once every receiver is dropped.
    pub fn cache_status_for_episode(
        &self,
        subject_id: impl Into<String>,
        episode_id: impl Into<String>,
    ) -> watch::Receiver<EpisodeCacheStatus> {
        let subject_id = subject_id.into();
        let episode_id = episode_id.into();
        let mut caches = self.subscribe();

        let initial = {
            let matching = matching_caches(&caches.borrow(), &subject_id, &episode_id);
            let stats: Vec<FileStats> = matching.iter().map(|c| *c.file_stats().borrow()).collect();
            episode_cache_status(&stats)
        };
        let (status, receiver) = watch::channel(initial);

        tokio::spawn(async move {
            loop {
                let matching =
                    matching_caches(&caches.borrow_and_update(), &subject_id, &episode_id);
                let mut stats: Vec<_> = matching.iter().map(|cache| cache.file_stats()).collect();

                loop {
                    let snapshot: Vec<FileStats> =
                        stats.iter_mut().map(|rx| *rx.borrow_and_update()).collect();
                    let next = episode_cache_status(&snapshot);
                    status.send_if_modified(|current| {
                        if *current == next {
                            return false;
                        }
                        *current = next;
                        true
                    });

                    tokio::select! {
                        changed = caches.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        () = next_stats_change(&mut stats) => {}
                        () = status.closed() => return,
                    }
                }
            }
        });

        receiver
    }

    /// Deletes a cache from the first storage that has it.
    ///
    /// # Errors
    ///
    /// - `StorageError` - The last storage failure, if no storage deleted it
    pub async fn delete_cache(&self, cache_id: &str) -> Result<bool, StorageError> {
        let mut last_error = None;
        for storage in &self.storages {
            match storage.delete(cache_id).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(storage = storage.id(), cache_id, error = %e, "Failed to delete cache");
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(false), Err)
    }

    /// Deletes the first cache matching `predicate`, trying storages in order.
    ///
    /// # Errors
    ///
    /// - `StorageError` - The last storage failure, if no storage deleted one
    pub async fn delete_first_cache(
        &self,
        predicate: CachePredicate<'_>,
    ) -> Result<bool, StorageError> {
        let mut last_error = None;
        for storage in &self.storages {
            match storage.delete_first(predicate).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(storage = storage.id(), error = %e, "Failed to delete cache");
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(false), Err)
    }

    /// Closes every cache of every storage concurrently.
    ///
    /// Failures are logged per cache and do not stop the other closes.
    /// Returns the number of caches that failed to close.
    pub async fn close_all_caches(&self) -> usize {
        let caches = self.all_caches();
        let results = join_all(caches.iter().map(|cache| cache.close())).await;

        let mut failures = 0;
        for (cache, result) in caches.iter().zip(results) {
            if let Err(e) = result {
                warn!(cache_id = cache.cache_id(), error = %e, "Failed to close cache");
                failures += 1;
            }
        }

        info!(closed = caches.len() - failures, failures, "Closed all caches");
        failures
    }

    /// Closes every storage. Used at application shutdown.
    pub async fn shutdown(&self) {
        let results = join_all(self.storages.iter().map(|storage| storage.close())).await;
        for (storage, result) in self.storages.iter().zip(results) {
            if let Err(e) = result {
                warn!(storage = storage.id(), error = %e, "Failed to close storage");
            }
        }
        debug!(storages = self.storages.len(), "Cache manager shut down");
    }
}

impl Drop for MediaCacheManager {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.abort();
        }
    }
}

fn concat_lists(receivers: &[watch::Receiver<Vec<Arc<dyn MediaCache>>>]) -> Vec<Arc<dyn MediaCache>> {
    receivers
        .iter()
        .flat_map(|rx| rx.borrow().clone())
        .collect()
}

async fn aggregate_lists(
    mut receivers: Vec<watch::Receiver<Vec<Arc<dyn MediaCache>>>>,
    sender: watch::Sender<Vec<Arc<dyn MediaCache>>>,
) {
    while !receivers.is_empty() {
        let (result, index) = {
            let (result, index, _rest) =
                select_all(receivers.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
            (result, index)
        };
        if result.is_err() {
            receivers.remove(index);
        }
        sender.send_replace(concat_lists(&receivers));
    }
}

/// Resolves when any of `stats` changes. Never resolves for an empty set.
async fn next_stats_change(stats: &mut Vec<watch::Receiver<FileStats>>) {
    loop {
        if stats.is_empty() {
            return pending().await;
        }

        let (result, index) = {
            let (result, index, _rest) =
                select_all(stats.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
            (result, index)
        };
        if result.is_ok() {
            return;
        }
        stats.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::cache::MediaCacheEngine;
    use crate::config::StorageConfig;
    use crate::storage::DirectoryMediaCacheStorage;
    use crate::test_utils::{TestMediaCacheEngine, magnet_media, sample_metadata};

    async fn storage(
        id: &str,
        dir: &Path,
        engine: &Arc<TestMediaCacheEngine>,
    ) -> Arc<dyn MediaCacheStorage> {
        DirectoryMediaCacheStorage::open(
            id,
            dir,
            Arc::clone(engine) as Arc<dyn MediaCacheEngine>,
            StorageConfig::default(),
        )
        .await
        .unwrap()
    }

    fn stats(total: u64, downloaded: u64) -> FileStats {
        FileStats::new(Some(total), downloaded, 0, 0)
    }

    #[test]
    fn test_status_prefers_finished_cache() {
        let status = episode_cache_status(&[stats(100, 10), stats(200, 200)]);
        assert_eq!(
            status,
            EpisodeCacheStatus::Cached {
                total_size: Some(200)
            }
        );
    }

    #[test]
    fn test_status_reports_most_progressed_unfinished_cache() {
        let status = episode_cache_status(&[stats(100, 10), stats(100, 60), FileStats::default()]);
        assert_eq!(
            status,
            EpisodeCacheStatus::Caching {
                progress: Progress::from_bytes(60, Some(100)),
                total_size: Some(100)
            }
        );
    }

    #[test]
    fn test_status_without_caches() {
        assert_eq!(episode_cache_status(&[]), EpisodeCacheStatus::NotCached);
    }

    #[test]
    fn test_unknown_size_is_caching_with_unspecified_progress() {
        let status = episode_cache_status(&[FileStats::default()]);
        assert_eq!(
            status,
            EpisodeCacheStatus::Caching {
                progress: Progress::UNSPECIFIED,
                total_size: None
            }
        );
    }

    #[tokio::test]
    async fn test_subscribe_aggregates_storages() {
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let engine = TestMediaCacheEngine::new();
        let a = storage("a", dir_a.path(), &engine).await;
        let b = storage("b", dir_b.path(), &engine).await;
        let manager = MediaCacheManager::new(vec![Arc::clone(&a), Arc::clone(&b)]);
        let mut list = manager.subscribe();
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");

        a.cache(media.clone(), sample_metadata("1", "10"), false).await.unwrap();
        b.cache(media, sample_metadata("1", "11"), false).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), list.wait_for(|caches| caches.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.all_caches().len(), 2);
        assert!(manager.storage("b").is_some());
        assert!(manager.storage("c").is_none());
        assert_eq!(
            manager.find_existing_cache("1", "11").unwrap().metadata().episode_id,
            "11"
        );
        assert!(manager.find_existing_cache("1", "12").is_none());
    }

    #[tokio::test]
    async fn test_manager_without_storages() {
        let manager = MediaCacheManager::new(Vec::new());
        assert!(manager.subscribe().borrow().is_empty());
        assert!(!manager.delete_cache("missing").await.unwrap());
        assert_eq!(manager.close_all_caches().await, 0);
    }

    #[tokio::test]
    async fn test_cache_status_follows_cache_set_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let local = storage("local", dir.path(), &engine).await;
        let manager = MediaCacheManager::new(vec![Arc::clone(&local)]);
        let mut status = manager.cache_status_for_episode("1", "10");
        assert_eq!(*status.borrow(), EpisodeCacheStatus::NotCached);

        let cache = local
            .cache(magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"), sample_metadata("1", "10"), true)
            .await
            .unwrap();
        let created = engine.last_created().unwrap();
        created.set_file_stats(stats(100, 40));
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| matches!(s, EpisodeCacheStatus::Caching { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        created.set_file_stats(stats(100, 100));
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| matches!(s, EpisodeCacheStatus::Cached { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        manager.delete_cache(cache.cache_id()).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == EpisodeCacheStatus::NotCached),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_first_cache_tries_storages_in_order() {
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let engine = TestMediaCacheEngine::new();
        let a = storage("a", dir_a.path(), &engine).await;
        let b = storage("b", dir_b.path(), &engine).await;
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");
        b.cache(media.clone(), sample_metadata("1", "10"), false).await.unwrap();
        a.cache(media, sample_metadata("1", "11"), false).await.unwrap();
        let manager = MediaCacheManager::new(vec![Arc::clone(&a), Arc::clone(&b)]);

        let deleted = manager
            .delete_first_cache(&|cache: &dyn MediaCache| cache.metadata().subject_id == "1")
            .await
            .unwrap();

        assert!(deleted);
        assert!(a.caches().is_empty());
        assert_eq!(b.caches().len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_caches_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TestMediaCacheEngine::new();
        let local = storage("local", dir.path(), &engine).await;
        let media = magnet_media("dmhy.1", "magnet:?xt=urn:btih:one");
        for episode in ["10", "11", "12"] {
            local.cache(media.clone(), sample_metadata("1", episode), true).await.unwrap();
        }
        engine.created()[1].set_close_fails(true);
        let manager = MediaCacheManager::new(vec![local]);

        let failures = manager.close_all_caches().await;

        assert_eq!(failures, 1);
        assert_eq!(engine.closed_count(), 2);
    }
}
