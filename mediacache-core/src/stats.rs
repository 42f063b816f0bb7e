//! Transfer statistics snapshots shared by sessions, caches and engines.

use serde::{Deserialize, Serialize};

/// Completion ratio in `0.0..=1.0`, or unspecified while the size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress(Option<f32>);

impl Progress {
    pub const UNSPECIFIED: Progress = Progress(None);
    pub const ZERO: Progress = Progress(Some(0.0));
    pub const COMPLETED: Progress = Progress(Some(1.0));

    /// Derives progress from byte counts.
    ///
    /// Unknown or zero totals yield `UNSPECIFIED` instead of dividing by zero.
    pub fn from_bytes(done: u64, total: Option<u64>) -> Self {
        match total {
            Some(total) if total > 0 => {
                Progress(Some((done.min(total) as f64 / total as f64) as f32))
            }
            _ => Progress::UNSPECIFIED,
        }
    }

    pub fn value(self) -> Option<f32> {
        self.0
    }

    pub fn is_specified(self) -> bool {
        self.0.is_some()
    }

    pub fn is_finished(self) -> bool {
        self.0.is_some_and(|value| value >= 1.0)
    }
}

/// Statistics for one file of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FileStats {
    /// File size, `None` until the torrent metadata is known
    pub total_size: Option<u64>,
    pub downloaded_bytes: u64,
    /// Bytes per second
    pub download_speed: u64,
    /// Bytes per second
    pub upload_speed: u64,
    pub progress: Progress,
}

impl FileStats {
    /// Builds a snapshot, deriving progress from the byte counts.
    pub fn new(
        total_size: Option<u64>,
        downloaded_bytes: u64,
        download_speed: u64,
        upload_speed: u64,
    ) -> Self {
        Self {
            total_size,
            downloaded_bytes,
            download_speed,
            upload_speed,
            progress: Progress::from_bytes(downloaded_bytes, total_size),
        }
    }

    /// Compares byte counts since `progress` rounds to `f32`.
    pub fn is_finished(&self) -> bool {
        self.total_size
            .is_some_and(|total| self.downloaded_bytes >= total)
    }
}

/// Statistics for a whole download session or an engine aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_size: Option<u64>,
    pub downloaded_bytes: u64,
    /// Bytes uploaded since the session started
    pub uploaded_bytes: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub progress: Progress,
}

impl SessionStats {
    pub fn new(
        total_size: Option<u64>,
        downloaded_bytes: u64,
        uploaded_bytes: u64,
        download_speed: u64,
        upload_speed: u64,
    ) -> Self {
        Self {
            total_size,
            downloaded_bytes,
            uploaded_bytes,
            download_speed,
            upload_speed,
            progress: Progress::from_bytes(downloaded_bytes, total_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_unknown_total_is_unspecified() {
        assert_eq!(Progress::from_bytes(10, None), Progress::UNSPECIFIED);
        assert_eq!(Progress::from_bytes(10, Some(0)), Progress::UNSPECIFIED);
        assert!(!Progress::UNSPECIFIED.is_finished());
    }

    #[test]
    fn test_progress_clamps_overshoot() {
        let progress = Progress::from_bytes(150, Some(100));
        assert_eq!(progress.value(), Some(1.0));
        assert!(progress.is_finished());
    }

    #[test]
    fn test_file_stats_derives_progress() {
        let stats = FileStats::new(Some(200), 50, 10, 0);
        assert_eq!(stats.progress.value(), Some(0.25));
        assert!(!stats.is_finished());
    }

    #[test]
    fn test_large_file_one_byte_short_is_not_finished() {
        let stats = FileStats::new(Some(100_000_001), 100_000_000, 0, 0);
        assert_eq!(stats.progress.value(), Some(1.0));
        assert!(!stats.is_finished());

        let done = FileStats::new(Some(100_000_001), 100_000_001, 0, 0);
        assert!(done.is_finished());
    }

    #[test]
    fn test_unknown_size_is_not_finished() {
        assert!(!FileStats::new(None, 500, 0, 0).is_finished());
    }
}
