//! Mediacache Core - torrent-backed media caching
//!
//! Reads byte ranges of files that are still downloading piece by piece,
//! persists and restores the set of downloads across restarts, and drives
//! the multi-stage protocol that decides what gets cached where.

pub mod cache;
pub mod config;
mod fs_util;
pub mod manager;
pub mod request;
pub mod stats;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::{CacheError, Media, MediaCache, MediaCacheEngine, MediaCacheMetadata};
pub use config::MediaCacheConfig;
pub use manager::{EpisodeCacheStatus, MediaCacheManager};
pub use request::{CacheRequestError, CacheRequestStage, EpisodeCacheRequester};
pub use storage::{DirectoryMediaCacheStorage, MediaCacheStorage, StorageError};
pub use streaming::{InputError, ReadOutcome, TorrentInput};
pub use torrent::{TorrentError, TorrentSession};

/// Errors that can bubble up from any media cache subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MediaCacheError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache request error: {0}")]
    Request(#[from] CacheRequestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaCacheError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MediaCacheError::Torrent(TorrentError::Unsupported { .. })
            | MediaCacheError::Cache(CacheError::Unsupported { .. })
            | MediaCacheError::Storage(StorageError::UnsupportedMedia { .. }) => {
                "This media cannot be cached".to_string()
            }
            MediaCacheError::Torrent(TorrentError::FetchTimeout { .. }) => {
                "Timed out fetching torrent metadata".to_string()
            }
            MediaCacheError::Torrent(_) | MediaCacheError::Cache(_) => {
                "Download error occurred".to_string()
            }
            MediaCacheError::Input(_) => "Playback read error occurred".to_string(),
            MediaCacheError::Storage(_) => "Storage error occurred".to_string(),
            MediaCacheError::Request(CacheRequestError::StaleStage) => {
                "The cache request was replaced by a newer one".to_string()
            }
            MediaCacheError::Request(CacheRequestError::NoStorage { .. }) => {
                "No storage can hold this media".to_string()
            }
            MediaCacheError::Request(e) => format!("Cache request failed: {e}"),
            MediaCacheError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error was caused by the caller's input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MediaCacheError::Input(InputError::InvalidArgument { .. })
                | MediaCacheError::Request(CacheRequestError::InvalidSelection { .. })
                | MediaCacheError::Storage(StorageError::UnsupportedMedia { .. })
                | MediaCacheError::Cache(CacheError::Unsupported { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, MediaCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let unsupported: MediaCacheError = CacheError::Unsupported {
            media_id: "web.1".to_string(),
        }
        .into();
        assert_eq!(unsupported.user_message(), "This media cannot be cached");
        assert!(unsupported.is_user_error());

        let stale: MediaCacheError = CacheRequestError::StaleStage.into();
        assert!(!stale.is_user_error());
        assert!(stale.user_message().contains("newer"));
    }

    #[test]
    fn test_invalid_argument_is_user_error() {
        let error: MediaCacheError = InputError::InvalidArgument {
            reason: "negative seek".to_string(),
        }
        .into();
        assert!(error.is_user_error());
    }
}
