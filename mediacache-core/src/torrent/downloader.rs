//! Contracts of the external BitTorrent downloader.
//!
//! The downloader owns the network transfer, piece verification and file
//! allocation. Everything above this module talks to it only through these
//! traits, so tests and alternative backends can be plugged in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::{FilePriority, Piece, TorrentError};
use crate::stats::SessionStats;

/// Raw torrent metadata as fetched from a magnet link or `.torrent` URL.
///
/// Opaque to this crate; only the downloader interprets the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentData {
    pub bytes: Bytes,
}

impl TorrentData {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// A file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileInfo {
    pub index: usize,
    /// Path relative to the torrent root, `/` separated
    pub path_in_torrent: String,
    /// Offset of the first byte within the concatenated torrent data
    pub offset_in_torrent: u64,
    pub length: u64,
}

/// A started download of one torrent.
#[async_trait]
pub trait TorrentSessionBackend: Send + Sync {
    /// Files of the torrent in torrent order.
    fn files(&self) -> Vec<TorrentFileInfo>;

    /// All pieces of the torrent, sharing state with the downloader.
    fn pieces(&self) -> Vec<Arc<Piece>>;

    /// Directory the downloader writes files into.
    fn save_directory(&self) -> PathBuf;

    /// Location of a file on disk.
    fn file_path(&self, file_index: usize) -> PathBuf;

    /// Sets the download priority for one file.
    fn set_file_priority(&self, file_index: usize, priority: FilePriority);

    /// Continuously updated session statistics.
    fn stats(&self) -> watch::Receiver<SessionStats>;

    /// Stops the transfer and releases every resource held by the session.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Downloader` - The backend failed to shut down cleanly
    async fn close(&self) -> Result<(), TorrentError>;
}

/// Entry point to the external downloader.
#[async_trait]
pub trait TorrentDownloader: Send + Sync {
    /// Fetches torrent metadata for a magnet link or `.torrent` URL.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Unsupported` - The URI scheme can never be fetched
    /// - `TorrentError::Downloader` - Transient failure, may be retried
    async fn fetch_torrent(&self, uri: &str, timeout: Duration) -> Result<TorrentData, TorrentError>;

    /// Starts a session for previously fetched metadata.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Downloader` - The session could not be created
    async fn start_session(
        &self,
        data: &TorrentData,
        save_directory: &Path,
    ) -> Result<Arc<dyn TorrentSessionBackend>, TorrentError>;

    /// Aggregate statistics across every session of this downloader.
    fn total_stats(&self) -> watch::Receiver<SessionStats>;
}
