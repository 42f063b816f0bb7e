use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use super::requester::{RequesterShared, StageGuard, check_stage_locked, close_chain};
use super::{CacheRequestError, EpisodeCacheRequest, MediaFetchSession, MediaSelector};
use crate::cache::{Media, MediaCache, MediaCacheMetadata};
use crate::storage::MediaCacheStorage;

/// One step of a cache request.
#[derive(Clone)]
pub enum CacheRequestStage {
    Idle,
    SelectMedia(SelectMedia),
    SelectStorage(SelectStorage),
    Done(Done),
}

impl CacheRequestStage {
    pub fn name(&self) -> &'static str {
        match self {
            CacheRequestStage::Idle => "idle",
            CacheRequestStage::SelectMedia(_) => "select_media",
            CacheRequestStage::SelectStorage(_) => "select_storage",
            CacheRequestStage::Done(_) => "done",
        }
    }

    pub(crate) fn id(&self) -> Option<u64> {
        match self {
            CacheRequestStage::Idle => None,
            CacheRequestStage::SelectMedia(stage) => Some(stage.id),
            CacheRequestStage::SelectStorage(stage) => Some(stage.id),
            CacheRequestStage::Done(stage) => Some(stage.id),
        }
    }

    pub(crate) fn fetch_session(&self) -> Option<&Arc<dyn MediaFetchSession>> {
        match self {
            CacheRequestStage::SelectMedia(stage) => Some(&stage.fetch_session),
            CacheRequestStage::SelectStorage(stage) => Some(&stage.fetch_session),
            CacheRequestStage::Idle | CacheRequestStage::Done(_) => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CacheRequestStage::Idle)
    }
}

impl fmt::Debug for CacheRequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheRequestStage::Idle => f.write_str("Idle"),
            CacheRequestStage::SelectMedia(stage) => stage.fmt(f),
            CacheRequestStage::SelectStorage(stage) => stage.fmt(f),
            CacheRequestStage::Done(stage) => stage.fmt(f),
        }
    }
}

fn upgrade(shared: &Weak<RequesterShared>) -> Result<Arc<RequesterShared>, CacheRequestError> {
    shared.upgrade().ok_or(CacheRequestError::StaleStage)
}

/// Waiting for the media to cache.
#[derive(Clone)]
pub struct SelectMedia {
    id: u64,
    shared: Weak<RequesterShared>,
    request: Arc<EpisodeCacheRequest>,
    fetch_session: Arc<dyn MediaFetchSession>,
    selector: Arc<dyn MediaSelector>,
}

impl SelectMedia {
    pub(crate) fn new(
        id: u64,
        shared: Weak<RequesterShared>,
        request: Arc<EpisodeCacheRequest>,
        fetch_session: Arc<dyn MediaFetchSession>,
        selector: Arc<dyn MediaSelector>,
    ) -> Self {
        Self {
            id,
            shared,
            request,
            fetch_session,
            selector,
        }
    }

    pub fn request(&self) -> &EpisodeCacheRequest {
        &self.request
    }

    pub fn fetch_session(&self) -> &Arc<dyn MediaFetchSession> {
        &self.fetch_session
    }

    pub fn selector(&self) -> &Arc<dyn MediaSelector> {
        &self.selector
    }

    /// Selects `media` and moves on to choosing a storage.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    /// - `CacheRequestError::InvalidSelection` - `media` is not a candidate
    /// - `CacheRequestError::NoStorage` - No storage can cache `media`
    pub async fn select(&self, media: Media) -> Result<SelectStorage, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;
        self.select_locked(&shared, &mut current, media)
    }

    fn select_locked(
        &self,
        shared: &Arc<RequesterShared>,
        current: &mut StageGuard<'_>,
        media: Media,
    ) -> Result<SelectStorage, CacheRequestError> {
        if !self.selector.select(&media) {
            return Err(CacheRequestError::InvalidSelection {
                reason: format!("media {} is not a candidate", media.media_id),
            });
        }

        let storages: Vec<_> = shared
            .manager
            .storages()
            .iter()
            .filter(|storage| storage.supports(&media))
            .cloned()
            .collect();
        if storages.is_empty() {
            self.selector.unselect();
            return Err(CacheRequestError::NoStorage {
                media_id: media.media_id,
            });
        }

        debug!(media_id = media.media_id, storages = storages.len(), "Selected media");
        let stage = SelectStorage {
            id: shared.next_id(),
            shared: Arc::downgrade(shared),
            request: Arc::clone(&self.request),
            fetch_session: Arc::clone(&self.fetch_session),
            selector: Arc::clone(&self.selector),
            media,
            storages,
        };
        shared.install(current, CacheRequestStage::SelectStorage(stage.clone()));
        Ok(stage)
    }

    /// Selects the candidate preferred by the selector, if there is one.
    ///
    /// # Errors
    ///
    /// Same as [`SelectMedia::select`].
    pub async fn try_auto_select_by_preference(
        &self,
    ) -> Result<Option<SelectStorage>, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        match self.selector.preferred() {
            Some(media) => self.select_locked(&shared, &mut current, media).map(Some),
            None => Ok(None),
        }
    }

    /// Selects a candidate that is already cached for another episode of
    /// the same subject, e.g. a season pack.
    ///
    /// # Errors
    ///
    /// Same as [`SelectMedia::select`].
    pub async fn try_auto_select_by_cached_season(
        &self,
    ) -> Result<Option<SelectStorage>, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        let cached_media_ids: Vec<String> = shared
            .manager
            .all_caches()
            .iter()
            .filter(|cache| !cache.is_deleted())
            .filter(|cache| cache.metadata().subject_id == self.request.subject_id)
            .map(|cache| cache.origin().media_id.clone())
            .collect();

        let candidate = self
            .selector
            .candidates()
            .into_iter()
            .find(|media| cached_media_ids.contains(&media.media_id));

        match candidate {
            Some(media) => self.select_locked(&shared, &mut current, media).map(Some),
            None => Ok(None),
        }
    }

    /// Abandons the request and returns to idle.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    pub async fn cancel(&self) -> Result<(), CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        close_chain(&current).await;
        shared.install(&mut current, CacheRequestStage::Idle);
        Ok(())
    }
}

impl fmt::Debug for SelectMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectMedia")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Waiting for the storage that will hold the selected media.
#[derive(Clone)]
pub struct SelectStorage {
    id: u64,
    shared: Weak<RequesterShared>,
    request: Arc<EpisodeCacheRequest>,
    fetch_session: Arc<dyn MediaFetchSession>,
    selector: Arc<dyn MediaSelector>,
    media: Media,
    storages: Vec<Arc<dyn MediaCacheStorage>>,
}

impl SelectStorage {
    pub fn request(&self) -> &EpisodeCacheRequest {
        &self.request
    }

    pub fn selected_media(&self) -> &Media {
        &self.media
    }

    /// Storages able to cache the selected media.
    pub fn storages(&self) -> &[Arc<dyn MediaCacheStorage>] {
        &self.storages
    }

    /// Selects the storage with `storage_id`, finishing the request.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    /// - `CacheRequestError::InvalidSelection` - The storage is not offered
    pub async fn select(&self, storage_id: &str) -> Result<Done, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        let storage = self
            .storages
            .iter()
            .find(|storage| storage.id() == storage_id)
            .cloned()
            .ok_or_else(|| CacheRequestError::InvalidSelection {
                reason: format!("storage {storage_id} is not offered"),
            })?;
        Ok(self.finish_locked(&shared, &mut current, storage).await)
    }

    async fn finish_locked(
        &self,
        shared: &Arc<RequesterShared>,
        current: &mut StageGuard<'_>,
        storage: Arc<dyn MediaCacheStorage>,
    ) -> Done {
        // Searching is over once a storage is chosen.
        self.fetch_session.close().await;

        let stage = Done {
            id: shared.next_id(),
            shared: Arc::downgrade(shared),
            metadata: self.request.metadata(),
            request: Arc::clone(&self.request),
            media: self.media.clone(),
            storage,
        };
        shared.install(current, CacheRequestStage::Done(stage.clone()));
        stage
    }

    /// Selects the only offered storage, if exactly one is offered.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    pub async fn try_select_single(&self) -> Result<Option<Done>, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        match self.storages.as_slice() {
            [storage] => Ok(Some(
                self.finish_locked(&shared, &mut current, Arc::clone(storage))
                    .await,
            )),
            _ => Ok(None),
        }
    }

    /// Selects a storage already holding a cache of the selected media.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    pub async fn try_select_by_cache(&self) -> Result<Option<Done>, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        let storage = self
            .storages
            .iter()
            .find(|storage| {
                storage.caches().iter().any(|cache| {
                    !cache.is_deleted() && cache.origin().media_id == self.media.media_id
                })
            })
            .cloned();

        match storage {
            Some(storage) => Ok(Some(self.finish_locked(&shared, &mut current, storage).await)),
            None => Ok(None),
        }
    }

    /// Goes back to media selection, keeping the search running.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - This stage is no longer current
    pub async fn cancel(&self) -> Result<SelectMedia, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let mut current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        self.selector.unselect();
        let stage = SelectMedia::new(
            shared.next_id(),
            Arc::downgrade(&shared),
            Arc::clone(&self.request),
            Arc::clone(&self.fetch_session),
            Arc::clone(&self.selector),
        );
        shared.install(&mut current, CacheRequestStage::SelectMedia(stage.clone()));
        Ok(stage)
    }
}

impl fmt::Debug for SelectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storages: Vec<&str> = self.storages.iter().map(|storage| storage.id()).collect();
        f.debug_struct("SelectStorage")
            .field("id", &self.id)
            .field("media_id", &self.media.media_id)
            .field("storages", &storages)
            .finish_non_exhaustive()
    }
}

/// Media and storage are chosen; the cache can be created.
#[derive(Clone)]
pub struct Done {
    id: u64,
    shared: Weak<RequesterShared>,
    request: Arc<EpisodeCacheRequest>,
    media: Media,
    storage: Arc<dyn MediaCacheStorage>,
    metadata: MediaCacheMetadata,
}

impl Done {
    pub fn request(&self) -> &EpisodeCacheRequest {
        &self.request
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn storage(&self) -> &Arc<dyn MediaCacheStorage> {
        &self.storage
    }

    pub fn metadata(&self) -> &MediaCacheMetadata {
        &self.metadata
    }

    /// Creates the cache in the chosen storage.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::StaleStage` - A newer request superseded this one
    /// - `CacheRequestError::Storage` - The storage failed to create the cache
    pub async fn create_cache(&self, resume: bool) -> Result<Arc<dyn MediaCache>, CacheRequestError> {
        let shared = upgrade(&self.shared)?;
        let current = shared.lock().await;
        check_stage_locked(&current, self.id)?;

        let cache = self
            .storage
            .cache(self.media.clone(), self.metadata.clone(), resume)
            .await?;
        info!(
            cache_id = cache.cache_id(),
            storage = self.storage.id(),
            "Cache request completed"
        );
        Ok(cache)
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("id", &self.id)
            .field("media_id", &self.media.media_id)
            .field("storage", &self.storage.id())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
