//! Shared setup for the integration tests.

use std::path::Path;
use std::sync::Arc;

use mediacache_core::cache::{MediaCacheEngine, TorrentMediaCacheEngine};
use mediacache_core::config::MediaCacheConfig;
use mediacache_core::storage::DirectoryMediaCacheStorage;
use mediacache_core::test_utils::MockTorrentDownloader;

pub const EPISODE_10_URI: &str = "magnet:?xt=urn:btih:frieren10";
pub const SEASON_PACK_URI: &str = "magnet:?xt=urn:btih:frierenpack";

/// Downloader knowing a single-episode torrent and a season pack.
pub fn downloader() -> Arc<MockTorrentDownloader> {
    let downloader = MockTorrentDownloader::new();
    downloader.add_torrent(EPISODE_10_URI, &[("Frieren - 10.mkv", 4096)], 256);
    downloader.add_torrent(
        SEASON_PACK_URI,
        &[
            ("Frieren/readme.txt", 100),
            ("Frieren/Frieren - 09.mkv", 2000),
            ("Frieren/Frieren - 10.mkv", 3000),
            ("Frieren/Frieren - 11.mkv", 2500),
        ],
        512,
    );
    downloader
}

/// Opens a storage with its metadata files in `root/metadata` and its
/// torrent data in `root/torrents`.
pub async fn torrent_storage(
    id: &str,
    root: &Path,
    downloader: &Arc<MockTorrentDownloader>,
) -> Arc<DirectoryMediaCacheStorage> {
    let config = MediaCacheConfig::for_testing();
    let engine = TorrentMediaCacheEngine::new(
        downloader.clone(),
        root.join("torrents"),
        config.engine,
    )
    .with_reader_config(config.reader);

    DirectoryMediaCacheStorage::open(
        id,
        root.join("metadata"),
        Arc::new(engine) as Arc<dyn MediaCacheEngine>,
        config.storage,
    )
    .await
    .unwrap()
}
