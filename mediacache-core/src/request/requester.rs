use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::debug;

use super::stage::{CacheRequestStage, SelectMedia};
use super::{CacheRequestError, EpisodeCacheRequest, MediaSourceFetcher};
use crate::manager::MediaCacheManager;

pub(crate) type StageGuard<'a> = MutexGuard<'a, CacheRequestStage>;

/// State shared by the requester and every stage it created.
pub(crate) struct RequesterShared {
    current: Mutex<CacheRequestStage>,
    published: watch::Sender<CacheRequestStage>,
    next_id: AtomicU64,
    pub(crate) manager: Arc<MediaCacheManager>,
    fetcher: Arc<dyn MediaSourceFetcher>,
}

impl RequesterShared {
    /// Serializes transitions; every stage method holds this guard.
    pub(crate) async fn lock(&self) -> StageGuard<'_> {
        self.current.lock().await
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replaces the current stage and publishes it.
    pub(crate) fn install(&self, current: &mut StageGuard<'_>, stage: CacheRequestStage) {
        debug!(from = current.name(), to = stage.name(), "Cache request transition");
        **current = stage.clone();
        self.published.send_replace(stage);
    }
}

/// Fails unless the stage with `id` is the current one.
pub(crate) fn check_stage_locked(
    current: &CacheRequestStage,
    id: u64,
) -> Result<(), CacheRequestError> {
    if current.id() == Some(id) {
        Ok(())
    } else {
        Err(CacheRequestError::StaleStage)
    }
}

/// Closes resources held by a stage that is being replaced.
pub(crate) async fn close_chain(stage: &CacheRequestStage) {
    if let Some(session) = stage.fetch_session() {
        session.close().await;
    }
}

/// Drives cache requests for one episode picker.
///
/// Only one chain of stages is live at a time: a new request or a cancel
/// closes the previous chain, and its stage objects become stale.
pub struct EpisodeCacheRequester {
    shared: Arc<RequesterShared>,
}

impl EpisodeCacheRequester {
    pub fn new(manager: Arc<MediaCacheManager>, fetcher: Arc<dyn MediaSourceFetcher>) -> Self {
        let (published, _) = watch::channel(CacheRequestStage::Idle);
        Self {
            shared: Arc::new(RequesterShared {
                current: Mutex::new(CacheRequestStage::Idle),
                published,
                next_id: AtomicU64::new(1),
                manager,
                fetcher,
            }),
        }
    }

    /// Live view of the current stage.
    pub fn stage(&self) -> watch::Receiver<CacheRequestStage> {
        self.shared.published.subscribe()
    }

    pub fn current(&self) -> CacheRequestStage {
        self.shared.published.borrow().clone()
    }

    /// Starts a new request, closing the previous chain first.
    ///
    /// # Errors
    ///
    /// - `CacheRequestError::Fetch` - The media search could not start; the
    ///   requester is left idle
    pub async fn request(
        &self,
        request: EpisodeCacheRequest,
    ) -> Result<SelectMedia, CacheRequestError> {
        let mut current = self.shared.lock().await;
        close_chain(&current).await;
        self.shared.install(&mut current, CacheRequestStage::Idle);

        let (fetch_session, selector) = self.shared.fetcher.start_session(&request).await?;
        let stage = SelectMedia::new(
            self.shared.next_id(),
            Arc::downgrade(&self.shared),
            Arc::new(request),
            fetch_session,
            selector,
        );
        self.shared
            .install(&mut current, CacheRequestStage::SelectMedia(stage.clone()));
        Ok(stage)
    }

    /// Abandons the current chain and returns to idle.
    pub async fn cancel(&self) {
        let mut current = self.shared.lock().await;
        close_chain(&current).await;
        self.shared.install(&mut current, CacheRequestStage::Idle);
    }
}
