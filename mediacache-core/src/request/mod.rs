//! Cache request protocol: choosing which media and which storage a new
//! cache uses.
//!
//! A request moves through `Idle -> SelectMedia -> SelectStorage -> Done`.
//! Stages are values; acting on a stage that is no longer current fails
//! with [`CacheRequestError::StaleStage`].

pub mod requester;
pub mod stage;

use std::sync::Arc;

use async_trait::async_trait;
pub use requester::EpisodeCacheRequester;
pub use stage::{CacheRequestStage, Done, SelectMedia, SelectStorage};
use tokio::sync::watch;

use crate::cache::{EpisodeSort, Media, MediaCacheMetadata};
use crate::stats::Progress;
use crate::storage::StorageError;

/// The episode a user wants to cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeCacheRequest {
    pub subject_id: String,
    pub episode_id: String,
    pub subject_names: Vec<String>,
    pub episode_sort: EpisodeSort,
    pub episode_ep: Option<EpisodeSort>,
    pub episode_name: String,
}

impl EpisodeCacheRequest {
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

    /// Metadata of the cache this request creates.
    pub fn metadata(&self) -> MediaCacheMetadata {
        let mut metadata = MediaCacheMetadata::new(
            self.subject_id.clone(),
            self.episode_id.clone(),
            self.episode_sort.clone(),
        )
        .with_subject_names(self.subject_names.clone())
        .with_episode_name(self.episode_name.clone());
        metadata.episode_ep = self.episode_ep.clone();
        metadata
    }
}

/// A running search for candidate media, provided by the media sources.
#[async_trait]
pub trait MediaFetchSession: Send + Sync {
    /// Candidates found so far.
    fn results(&self) -> watch::Receiver<Vec<Media>>;

    /// Progress of the search over all sources.
    fn progress(&self) -> watch::Receiver<Progress>;

    /// Stops the search. Idempotent.
    async fn close(&self);
}

/// Holds the user's (or an automatic) choice among fetched candidates.
pub trait MediaSelector: Send + Sync {
    fn candidates(&self) -> Vec<Media>;

    fn selected(&self) -> Option<Media>;

    /// Marks `media` as selected. Returns false if it is not a candidate.
    fn select(&self, media: &Media) -> bool;

    fn unselect(&self);

    /// The candidate best matching the user's preferences, if any.
    fn preferred(&self) -> Option<Media>;
}

/// Starts media searches for cache requests.
#[async_trait]
pub trait MediaSourceFetcher: Send + Sync {
    /// # Errors
    ///
    /// - `CacheRequestError::Fetch` - No search could be started
    async fn start_session(
        &self,
        request: &EpisodeCacheRequest,
    ) -> Result<(Arc<dyn MediaFetchSession>, Arc<dyn MediaSelector>), CacheRequestError>;
}

/// Errors of the cache request protocol.
#[derive(Debug, thiserror::Error)]
pub enum CacheRequestError {
    /// Another transition superseded the stage the caller acted on
    #[error("Cache request stage is no longer current")]
    StaleStage,

    #[error("Invalid selection: {reason}")]
    InvalidSelection { reason: String },

    #[error("No storage can cache media {media_id}")]
    NoStorage { media_id: String },

    #[error("Media fetch failed: {reason}")]
    Fetch { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
