//! Centralized configuration for the media cache.
//!
//! Tunable values live here instead of being scattered across the storages,
//! engines and readers.

use std::time::Duration;

use crate::torrent::FilePriority;

/// Configuration for every media cache component.
#[derive(Debug, Clone, Default)]
pub struct MediaCacheConfig {
    pub reader: ReaderConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

/// Buffered torrent reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Total window around the read position; half of it may lie behind
    pub buffer_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024, // 8 KiB
        }
    }
}

/// Directory storage settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum caches restored concurrently at startup
    pub restore_concurrency: usize,
    /// Extension of per-cache metadata files, without the dot
    pub metadata_extension: String,
    /// File name of the storage-wide aggregates
    pub save_data_file: String,
    /// Larger single upload increments are discarded as implausible
    pub max_upload_delta_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            restore_concurrency: 8,
            metadata_extension: "metadata".to_string(),
            save_data_file: "storage-data.json".to_string(),
            max_upload_delta_bytes: 64 * 1024 * 1024 * 1024, // 64 GiB
        }
    }
}

/// Torrent engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts to fetch torrent metadata before giving up
    pub fetch_attempts: u32,
    /// Timeout of a single fetch attempt
    pub fetch_timeout: Duration,
    /// Priority requested by a resumed cache
    pub default_priority: FilePriority,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            fetch_timeout: Duration::from_secs(30),
            default_priority: FilePriority::Normal,
        }
    }
}

impl EngineConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

impl MediaCacheConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(size) = lookup("MEDIACACHE_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
            config.reader.buffer_size = size;
        }

        if let Some(count) = lookup("MEDIACACHE_RESTORE_CONCURRENCY").and_then(|v| v.parse().ok())
        {
            config.storage.restore_concurrency = count;
        }

        if let Some(attempts) = lookup("MEDIACACHE_FETCH_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.engine.fetch_attempts = attempts;
        }

        if let Some(seconds) = lookup("MEDIACACHE_FETCH_TIMEOUT").and_then(|v| v.parse().ok()) {
            config.engine.fetch_timeout = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            reader: ReaderConfig { buffer_size: 64 },
            storage: StorageConfig {
                restore_concurrency: 2,
                ..StorageConfig::default()
            },
            engine: EngineConfig::for_testing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = MediaCacheConfig::default();
        assert_eq!(config.reader.buffer_size, 8192);
        assert_eq!(config.storage.restore_concurrency, 8);
        assert_eq!(config.storage.metadata_extension, "metadata");
        assert_eq!(config.engine.fetch_attempts, 3);
    }

    #[test]
    fn test_overrides_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("MEDIACACHE_BUFFER_SIZE", "4096"),
            ("MEDIACACHE_FETCH_TIMEOUT", "5"),
            ("MEDIACACHE_FETCH_ATTEMPTS", "many"),
        ]
        .into_iter()
        .collect();

        let config = MediaCacheConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.reader.buffer_size, 4096);
        assert_eq!(config.engine.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.fetch_attempts, 3);
    }
}
