//! Caches survive a restart of their storage.

use mediacache_core::cache::{MediaCacheState, ResourceLocation};
use mediacache_core::storage::MediaCacheStorage;
use mediacache_core::test_utils::{MockTorrentDownloader, magnet_media, sample_metadata};
use mediacache_core::torrent::FilePriority;

use crate::fixtures::{EPISODE_10_URI, SEASON_PACK_URI, downloader, torrent_storage};

#[tokio::test]
async fn test_storage_restores_torrent_caches_after_restart() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage = torrent_storage("local", root.path(), &downloader).await;
    let media = magnet_media("dmhy.10", EPISODE_10_URI);
    let metadata = sample_metadata("frieren", "10");

    let cache = storage
        .cache(media.clone(), metadata.clone(), true)
        .await
        .unwrap();
    let cache_id = cache.cache_id().to_string();
    storage.close().await.unwrap();
    drop(cache);
    drop(storage);

    let orphan = root.path().join("torrents").join("stale-cache");
    std::fs::create_dir_all(&orphan).unwrap();

    // Nothing is registered: restoring must use the stored torrent data.
    let offline = MockTorrentDownloader::new();
    let reopened = torrent_storage("local", root.path(), &offline).await;

    let caches = reopened.caches();
    assert_eq!(caches.len(), 1);
    let restored = &caches[0];
    assert_eq!(restored.cache_id(), cache_id);
    assert_eq!(restored.origin(), &media);
    assert_eq!(restored.metadata(), &metadata);
    assert_eq!(*restored.state().borrow(), MediaCacheState::InProgress);

    assert_eq!(offline.fetch_attempts(), 0);
    assert_eq!(
        offline.last_session().unwrap().file_priority(0),
        FilePriority::Normal
    );
    assert!(!orphan.exists());
    assert!(root.path().join("torrents").join(&cache_id).exists());

    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_restore_keeps_downloads_for_next_start() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage = torrent_storage("local", root.path(), &downloader).await;
    let cache = storage
        .cache(
            magnet_media("dmhy.10", EPISODE_10_URI),
            sample_metadata("frieren", "10"),
            true,
        )
        .await
        .unwrap();
    let cache_id = cache.cache_id().to_string();
    storage.close().await.unwrap();
    drop(cache);
    drop(storage);

    let cache_dir = root.path().join("torrents").join(&cache_id);
    let torrent_data = cache_dir.join("torrent.data");
    let episode_file = cache_dir.join("Frieren - 10.mkv");
    let metadata_file = root
        .path()
        .join("metadata")
        .join(format!("{cache_id}.metadata"));
    let valid_data = std::fs::read(&torrent_data).unwrap();
    std::fs::write(&torrent_data, b"truncated").unwrap();

    let broken = torrent_storage("local", root.path(), &downloader).await;

    assert!(broken.caches().is_empty());
    assert!(metadata_file.exists());
    assert!(episode_file.exists());
    assert!(torrent_data.exists());
    drop(broken);

    std::fs::write(&torrent_data, valid_data).unwrap();
    let repaired = torrent_storage("local", root.path(), &downloader).await;

    let caches = repaired.caches();
    assert_eq!(caches.len(), 1);
    assert_eq!(caches[0].cache_id(), cache_id);
    repaired.close().await.unwrap();
}

#[tokio::test]
async fn test_deleting_cache_removes_metadata_and_downloads() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage = torrent_storage("local", root.path(), &downloader).await;
    let cache = storage
        .cache(
            magnet_media("dmhy.10", EPISODE_10_URI),
            sample_metadata("frieren", "10"),
            true,
        )
        .await
        .unwrap();
    let metadata_file = root
        .path()
        .join("metadata")
        .join(format!("{}.metadata", cache.cache_id()));
    let torrent_dir = root.path().join("torrents").join(cache.cache_id());
    assert!(metadata_file.exists());
    assert!(torrent_dir.exists());

    assert!(storage.delete(cache.cache_id()).await.unwrap());

    assert!(!metadata_file.exists());
    assert!(!torrent_dir.exists());
    assert!(downloader.last_session().unwrap().is_closed());

    drop(storage);
    let reopened = torrent_storage("local", root.path(), &downloader).await;
    assert!(reopened.caches().is_empty());
}

#[tokio::test]
async fn test_season_pack_caches_pick_episode_files() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage = torrent_storage("local", root.path(), &downloader).await;

    let largest = storage
        .cache(
            magnet_media("dmhy.pack", SEASON_PACK_URI),
            sample_metadata("frieren", "10"),
            true,
        )
        .await
        .unwrap();
    let hinted = storage
        .cache(
            magnet_media("dmhy.pack", SEASON_PACK_URI).with_file_hint("Frieren/Frieren - 11.mkv"),
            sample_metadata("frieren", "11"),
            true,
        )
        .await
        .unwrap();
    assert_ne!(largest.cache_id(), hinted.cache_id());

    let ResourceLocation::LocalFile { path } = largest.cached_media().await.unwrap().download else {
        panic!("expected a local file");
    };
    assert!(path.ends_with("Frieren - 10.mkv"));
    assert!(path.exists());

    let session = downloader.last_session().unwrap();
    assert_eq!(session.file_priority(3), FilePriority::Normal);
    assert_eq!(session.file_priority(2), FilePriority::Ignore);
    assert_eq!(session.file_priority(0), FilePriority::Ignore);

    hinted.pause().await.unwrap();
    assert_eq!(session.file_priority(3), FilePriority::Ignore);

    storage.close().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_metadata_does_not_block_restore() {
    let root = tempfile::tempdir().unwrap();
    let downloader = downloader();
    let storage = torrent_storage("local", root.path(), &downloader).await;
    storage
        .cache(
            magnet_media("dmhy.10", EPISODE_10_URI),
            sample_metadata("frieren", "10"),
            false,
        )
        .await
        .unwrap();
    storage.close().await.unwrap();
    drop(storage);

    let broken = root.path().join("metadata").join("broken.metadata");
    std::fs::write(&broken, b"\x00\x01 definitely not json").unwrap();

    let reopened = torrent_storage("local", root.path(), &downloader).await;

    assert_eq!(reopened.caches().len(), 1);
    assert!(!broken.exists());
    reopened.close().await.unwrap();
}
