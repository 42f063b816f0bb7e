//! Identity of a cached episode and derivation of stable cache ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Sort key of an episode within a subject, e.g. `"01"` or `"12.5"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeSort(String);

impl EpisodeSort {
    pub fn new(sort: impl Into<String>) -> Self {
        Self(sort.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if the sort is a plain number.
    pub fn number(&self) -> Option<f32> {
        self.0.trim().parse().ok()
    }
}

impl fmt::Display for EpisodeSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subject and episode a cache belongs to. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCacheMetadata {
    pub subject_id: String,
    pub episode_id: String,
    #[serde(default)]
    pub subject_names: Vec<String>,
    pub episode_sort: EpisodeSort,
    /// Sort within the current season, when it differs from `episode_sort`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_ep: Option<EpisodeSort>,
    #[serde(default)]
    pub episode_name: String,
}

impl MediaCacheMetadata {
    pub fn new(
        subject_id: impl Into<String>,
        episode_id: impl Into<String>,
        episode_sort: EpisodeSort,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            episode_id: episode_id.into(),
            subject_names: Vec::new(),
            episode_sort,
            episode_ep: None,
            episode_name: String::new(),
        }
    }

    pub fn with_subject_names(mut self, names: Vec<String>) -> Self {
        self.subject_names = names;
        self
    }

    pub fn with_episode_name(mut self, name: impl Into<String>) -> Self {
        self.episode_name = name.into();
        self
    }

    pub fn is_episode(&self, subject_id: &str, episode_id: &str) -> bool {
        self.subject_id == subject_id && self.episode_id == episode_id
    }
}

const NAME_PREFIX_CHARS: usize = 8;
const HASH_TERM_BYTES: usize = 4;

/// Derives the stable id used as the on-disk file stem of a cache.
///
/// The id is a short sanitized subject name followed by one hash term per
/// identity field: `<name>-<origin>-<subject>-<episode>`. Hashes use SHA-1 so
/// ids stay identical across builds and platforms.
pub fn calculate_cache_id(origin_media_id: &str, metadata: &MediaCacheMetadata) -> String {
    let name = metadata
        .subject_names
        .first()
        .map(|name| sanitize(name))
        .filter(|name| !name.is_empty())
        .or_else(|| Some(sanitize(&metadata.subject_id)).filter(|id| !id.is_empty()))
        .unwrap_or_else(|| "cache".to_string());

    format!(
        "{name}-{}-{}-{}",
        hash_term(origin_media_id),
        hash_term(&metadata.subject_id),
        hash_term(&metadata.episode_id)
    )
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(NAME_PREFIX_CHARS)
        .collect()
}

fn hash_term(value: &str) -> String {
    let digest = Sha1::digest(value.as_bytes());
    hex::encode(&digest[..HASH_TERM_BYTES])
}
