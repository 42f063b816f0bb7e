//! Torrent-side building blocks: pieces, file entries, handles and sessions.
//!
//! The actual BitTorrent transfer is performed by an external downloader
//! reached through [`TorrentDownloader`] and [`TorrentSessionBackend`]. This
//! module maps its files onto pieces and coordinates which files download
//! and at what priority.

pub mod downloader;
pub mod file_entry;
pub mod matcher;
pub mod piece;
pub mod session;

use std::fmt;
use std::path::PathBuf;

pub use downloader::{TorrentData, TorrentDownloader, TorrentFileInfo, TorrentSessionBackend};
pub use file_entry::{FilePriority, TorrentFileEntry, TorrentFileHandle};
pub use matcher::match_pieces_for_file;
pub use piece::{Piece, PieceState};
pub use session::TorrentSession;

/// Zero-based index of a piece within a torrent.
///
/// Torrent data is divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Layout corruption signals a bug in the torrent model and is never retried.
/// `Unsupported` marks structurally impossible requests that must fail fast.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Corrupt torrent layout: {reason}")]
    CorruptLayout { reason: String },

    #[error("Unsupported torrent source: {reason}")]
    Unsupported { reason: String },

    #[error("Downloader error: {reason}")]
    Downloader { reason: String },

    #[error("Timed out fetching {uri}")]
    FetchTimeout { uri: String },

    #[error("Torrent file {index} not found")]
    FileNotFound { index: usize },

    #[error("Torrent has no playable file")]
    NoPlayableFile,

    #[error("File handle is closed")]
    HandleClosed,

    #[error("Torrent session is closed")]
    SessionClosed,

    #[error("Cannot open {path}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Returns true if retrying the same operation cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TorrentError::CorruptLayout { .. } | TorrentError::Unsupported { .. }
        )
    }
}
