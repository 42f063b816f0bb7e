//! Requesting an episode cache end to end, from media search to status.

use std::sync::Arc;
use std::time::Duration;

use mediacache_core::manager::{EpisodeCacheStatus, MediaCacheManager};
use mediacache_core::request::EpisodeCacheRequester;
use mediacache_core::storage::MediaCacheStorage;
use mediacache_core::test_utils::{TestMediaFetcher, magnet_media, sample_metadata, sample_request};
use mediacache_core::{CacheRequestError, CacheRequestStage};
use tokio::sync::watch;

use crate::fixtures::{EPISODE_10_URI, SEASON_PACK_URI, downloader, torrent_storage};

async fn wait_for_status(
    status: &mut watch::Receiver<EpisodeCacheStatus>,
    expected: impl Fn(&EpisodeCacheStatus) -> bool,
) -> EpisodeCacheStatus {
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| expected(s)))
        .await
        .expect("status did not change in time")
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_requested_episode_reports_caching_then_cached() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage: Arc<dyn MediaCacheStorage> =
        torrent_storage("local", root.path(), &downloader).await;
    let manager = Arc::new(MediaCacheManager::new(vec![storage.clone()]));
    let fetcher = TestMediaFetcher::new(vec![
        magnet_media("dmhy.10", EPISODE_10_URI),
        magnet_media("dmhy.pack", SEASON_PACK_URI),
    ]);
    fetcher.set_preferred(Some("dmhy.10"));
    let requester = EpisodeCacheRequester::new(Arc::clone(&manager), fetcher.clone());

    let mut status = manager.cache_status_for_episode("frieren", "10");
    assert_eq!(*status.borrow(), EpisodeCacheStatus::NotCached);

    let select_media = requester
        .request(sample_request("frieren", "10"))
        .await
        .unwrap();
    let select_storage = select_media
        .try_auto_select_by_preference()
        .await
        .unwrap()
        .expect("preferred media is a candidate");
    let done = select_storage.try_select_single().await.unwrap().unwrap();
    let cache = done.create_cache(true).await.unwrap();

    assert_eq!(cache.origin().media_id, "dmhy.10");
    assert!(fetcher.sessions()[0].is_closed());
    assert!(matches!(requester.current(), CacheRequestStage::Done(_)));

    wait_for_status(&mut status, |s| matches!(s, EpisodeCacheStatus::Caching { .. })).await;

    downloader.last_session().unwrap().finish_all();
    let cached =
        wait_for_status(&mut status, |s| matches!(s, EpisodeCacheStatus::Cached { .. })).await;
    assert_eq!(
        cached,
        EpisodeCacheStatus::Cached {
            total_size: Some(4096)
        }
    );

    assert!(manager.delete_cache(cache.cache_id()).await.unwrap());
    wait_for_status(&mut status, |s| *s == EpisodeCacheStatus::NotCached).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_next_episode_reuses_cached_season_pack() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage: Arc<dyn MediaCacheStorage> =
        torrent_storage("local", root.path(), &downloader).await;
    storage
        .cache(
            magnet_media("dmhy.pack", SEASON_PACK_URI),
            sample_metadata("frieren", "10"),
            false,
        )
        .await
        .unwrap();
    let manager = Arc::new(MediaCacheManager::new(vec![storage.clone()]));
    let requester = EpisodeCacheRequester::new(
        Arc::clone(&manager),
        TestMediaFetcher::new(vec![
            magnet_media("dmhy.11", "magnet:?xt=urn:btih:frieren11"),
            magnet_media("dmhy.pack", SEASON_PACK_URI),
        ]),
    );

    let select_media = requester
        .request(sample_request("frieren", "11"))
        .await
        .unwrap();
    let select_storage = select_media
        .try_auto_select_by_cached_season()
        .await
        .unwrap()
        .expect("season pack is already cached");
    assert_eq!(select_storage.selected_media().media_id, "dmhy.pack");

    let done = select_storage.try_select_by_cache().await.unwrap().unwrap();
    assert_eq!(done.storage().id(), "local");
    let cache = done.create_cache(false).await.unwrap();

    assert_eq!(cache.metadata().episode_id, "11");
    assert_eq!(storage.caches().len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_new_request_supersedes_unfinished_one() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage: Arc<dyn MediaCacheStorage> =
        torrent_storage("local", root.path(), &downloader).await;
    let manager = Arc::new(MediaCacheManager::new(vec![storage.clone()]));
    let fetcher = TestMediaFetcher::new(vec![magnet_media("dmhy.10", EPISODE_10_URI)]);
    let requester = EpisodeCacheRequester::new(Arc::clone(&manager), fetcher.clone());

    let first = requester
        .request(sample_request("frieren", "10"))
        .await
        .unwrap();
    let second = requester
        .request(sample_request("frieren", "10"))
        .await
        .unwrap();

    let stale = first.select(magnet_media("dmhy.10", EPISODE_10_URI)).await;
    assert!(matches!(stale, Err(CacheRequestError::StaleStage)));
    assert!(fetcher.sessions()[0].is_closed());
    assert!(!fetcher.sessions()[1].is_closed());

    let select_storage = second
        .select(magnet_media("dmhy.10", EPISODE_10_URI))
        .await
        .unwrap();
    requester.cancel().await;
    assert!(requester.current().is_idle());
    assert!(matches!(
        select_storage.select("local").await,
        Err(CacheRequestError::StaleStage)
    ));
    assert!(storage.caches().is_empty());

    manager.shutdown().await;
}
