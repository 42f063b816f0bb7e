//! Remote media descriptions consumed by the cache engines.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a media's bytes can be obtained from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceLocation {
    MagnetLink { uri: String },
    /// URL of a `.torrent` file
    HttpTorrentFile { uri: String },
    /// A directly playable stream
    WebVideo { uri: String },
    LocalFile { path: PathBuf },
}

impl ResourceLocation {
    pub fn uri(&self) -> String {
        match self {
            ResourceLocation::MagnetLink { uri }
            | ResourceLocation::HttpTorrentFile { uri }
            | ResourceLocation::WebVideo { uri } => uri.clone(),
            ResourceLocation::LocalFile { path } => format!("file://{}", path.display()),
        }
    }

    /// Returns true for locations resolved through a torrent.
    pub fn is_torrent(&self) -> bool {
        matches!(
            self,
            ResourceLocation::MagnetLink { .. } | ResourceLocation::HttpTorrentFile { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceKind {
    #[default]
    Bittorrent,
    Web,
    LocalCache,
}

/// Descriptive properties shown to users when choosing between candidates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaProperties {
    pub subtitle_languages: Vec<String>,
    pub resolution: String,
    /// Release group
    pub alliance: String,
    pub size: Option<u64>,
}

/// A candidate media item produced by a media source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Globally unique, stable across fetches
    pub media_id: String,
    pub media_source_id: String,
    #[serde(default)]
    pub original_url: String,
    pub download: ResourceLocation,
    #[serde(default)]
    pub original_title: String,
    #[serde(default)]
    pub properties: MediaProperties,
    #[serde(default)]
    pub kind: MediaSourceKind,
    /// Path inside a multi-file torrent holding this media's episode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hint: Option<String>,
}

impl Media {
    pub fn new(
        media_id: impl Into<String>,
        media_source_id: impl Into<String>,
        download: ResourceLocation,
    ) -> Self {
        Self {
            media_id: media_id.into(),
            media_source_id: media_source_id.into(),
            original_url: String::new(),
            download,
            original_title: String::new(),
            properties: MediaProperties::default(),
            kind: MediaSourceKind::default(),
            file_hint: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.original_title = title.into();
        self
    }

    pub fn with_file_hint(mut self, path_in_torrent: impl Into<String>) -> Self {
        self.file_hint = Some(path_in_torrent.into());
        self
    }
}

/// A cache presented as playable media, pointing at the local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMedia {
    pub origin: Media,
    pub cache_id: String,
    pub download: ResourceLocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_ignores_unknown_fields() {
        let json = r#"{
            "media_id": "dmhy.1",
            "media_source_id": "dmhy",
            "download": {"type": "magnet_link", "uri": "magnet:?xt=urn:btih:abc"},
            "added_in_a_later_version": 42
        }"#;

        let media: Media = serde_json::from_str(json).unwrap();
        assert_eq!(media.media_id, "dmhy.1");
        assert!(media.download.is_torrent());
        assert_eq!(media.kind, MediaSourceKind::Bittorrent);
    }

    #[test]
    fn test_resource_location_uri() {
        let location = ResourceLocation::LocalFile {
            path: PathBuf::from("/tmp/a.mkv"),
        };
        assert_eq!(location.uri(), "file:///tmp/a.mkv");
        assert!(!location.is_torrent());
    }
}
