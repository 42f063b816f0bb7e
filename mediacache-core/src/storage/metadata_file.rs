//! On-disk format of per-cache metadata files.
//!
//! Each cache is described by `<cacheId>.<extension>` containing the JSON of
//! [`MediaCacheSave`]. Unknown fields are ignored when reading so that files
//! written by newer versions still restore.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StorageError;
use crate::cache::{Media, MediaCacheMetadata};
use crate::fs_util::write_atomic;

/// Everything needed to restore one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCacheSave {
    pub origin: Media,
    pub metadata: MediaCacheMetadata,
}

/// Canonical metadata file path for `cache_id`.
pub fn metadata_path(directory: &Path, cache_id: &str, extension: &str) -> PathBuf {
    directory.join(format!("{cache_id}.{extension}"))
}

/// Reads and decodes a metadata file.
///
/// # Errors
///
/// - `StorageError::Io` - The file could not be read
/// - `StorageError::Serialization` - The file is not a valid cache save
pub async fn read_save(path: &Path) -> Result<MediaCacheSave, StorageError> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically writes a metadata file.
///
/// # Errors
///
/// - `StorageError::Io` - The file could not be written
/// - `StorageError::Serialization` - The save could not be encoded
pub async fn write_save(path: &Path, save: &MediaCacheSave) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(save).map_err(|source| StorageError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

/// Lists metadata files in `directory`, sorted by path.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// - `StorageError::Io` - The directory could not be read
pub async fn list_metadata_files(
    directory: &Path,
    extension: &str,
) -> Result<Vec<PathBuf>, StorageError> {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path.extension().is_some_and(|ext| ext == extension);
        if matches && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{magnet_media, sample_metadata};

    #[tokio::test]
    async fn test_write_then_read_save() {
        let dir = tempfile::tempdir().unwrap();
        let save = MediaCacheSave {
            origin: magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"),
            metadata: sample_metadata("1", "10"),
        };
        let path = metadata_path(dir.path(), "abc", "metadata");

        write_save(&path, &save).await.unwrap();

        assert_eq!(read_save(&path).await.unwrap(), save);
        assert!(!dir.path().join("abc.metadata.tmp").exists());
    }

    #[tokio::test]
    async fn test_unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let save = MediaCacheSave {
            origin: magnet_media("dmhy.1", "magnet:?xt=urn:btih:one"),
            metadata: sample_metadata("1", "10"),
        };
        let mut json = serde_json::to_value(&save).unwrap();
        json["written_by"] = serde_json::json!("a newer version");
        json["metadata"]["extra"] = serde_json::json!({"nested": true});
        let path = dir.path().join("abc.metadata");
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        assert_eq!(read_save(&path).await.unwrap(), save);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.metadata");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = read_save(&path).await;

        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[tokio::test]
    async fn test_list_metadata_files_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.metadata"), b"{}").unwrap();
        std::fs::write(dir.path().join("a.metadata"), b"{}").unwrap();
        std::fs::write(dir.path().join("a.metadata.tmp"), b"{}").unwrap();
        std::fs::write(dir.path().join("storage-data.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("dir.metadata")).unwrap();

        let files = list_metadata_files(dir.path(), "metadata").await.unwrap();

        assert_eq!(
            files,
            vec![dir.path().join("a.metadata"), dir.path().join("b.metadata")]
        );
        let missing = list_metadata_files(&dir.path().join("missing"), "metadata")
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
