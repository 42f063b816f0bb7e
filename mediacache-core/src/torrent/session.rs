//! A started torrent download and the lifetime of its file handles.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    FilePriority, TorrentError, TorrentFileEntry, TorrentSessionBackend, match_pieces_for_file,
};
use crate::stats::SessionStats;

#[derive(Debug, Default)]
struct HandleCount {
    open: usize,
    closing: bool,
}

/// Reference count of open handles plus a one-shot "fully closed" signal.
///
/// Releasing the last handle shuts the backend down; every closer waits
/// until the shutdown has completed.
pub(crate) struct SessionLifecycle {
    backend: Arc<dyn TorrentSessionBackend>,
    count: Mutex<HandleCount>,
    closed: watch::Sender<bool>,
}

impl SessionLifecycle {
    fn new(backend: Arc<dyn TorrentSessionBackend>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            backend,
            count: Mutex::new(HandleCount::default()),
            closed,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn TorrentSessionBackend> {
        &self.backend
    }

    pub(crate) fn acquire(&self) -> Result<(), TorrentError> {
        let mut count = self.count.lock();
        if count.closing {
            return Err(TorrentError::SessionClosed);
        }
        count.open += 1;
        Ok(())
    }

    fn release_count(&self) -> bool {
        let mut count = self.count.lock();
        count.open = count.open.saturating_sub(1);
        count.open == 0
    }

    /// Releases one handle, shutting the session down if it was the last one.
    pub(crate) async fn release(self: &Arc<Self>) -> Result<(), TorrentError> {
        if self.release_count() {
            self.shutdown().await
        } else {
            Ok(())
        }
    }

    /// Releases one handle without waiting, used when a handle is dropped.
    pub(crate) fn release_detached(self: &Arc<Self>) {
        if !self.release_count() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let lifecycle = Arc::clone(self);
                runtime.spawn(async move {
                    if let Err(e) = lifecycle.shutdown().await {
                        warn!(error = %e, "Failed to close torrent session after handle drop");
                    }
                });
            }
            Err(_) => warn!("Last torrent file handle dropped outside a runtime, session left open"),
        }
    }

    /// Shuts the backend down once and waits until it has fully closed.
    ///
    /// The backend close runs in its own task so that it completes even if
    /// the caller is cancelled.
    pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<(), TorrentError> {
        let initiator = {
            let mut count = self.count.lock();
            !std::mem::replace(&mut count.closing, true)
        };

        if initiator {
            let lifecycle = Arc::clone(self);
            let task = tokio::spawn(async move {
                let result = lifecycle.backend.close().await;
                lifecycle.closed.send_replace(true);
                result
            });
            return task.await.map_err(|e| TorrentError::Downloader {
                reason: format!("session close task failed: {e}"),
            })?;
        }

        let mut closed = self.closed.subscribe();
        // The sender is owned by `self`, so it outlives this wait.
        let _ = closed.wait_for(|closed| *closed).await;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.count.lock().open
    }
}

/// A running download of one torrent, split into file entries.
///
/// Files start with `FilePriority::Ignore`; they only download while at
/// least one handle requests a priority.
pub struct TorrentSession {
    lifecycle: Arc<SessionLifecycle>,
    entries: Vec<Arc<TorrentFileEntry>>,
}

impl TorrentSession {
    /// Builds file entries for every file of a started backend session.
    ///
    /// # Errors
    ///
    /// - `TorrentError::CorruptLayout` - A file is not covered by contiguous pieces
    pub fn open(backend: Arc<dyn TorrentSessionBackend>) -> Result<Self, TorrentError> {
        let pieces = backend.pieces();
        let lifecycle = Arc::new(SessionLifecycle::new(Arc::clone(&backend)));

        let entries = backend
            .files()
            .into_iter()
            .map(|file| {
                let matched =
                    match_pieces_for_file(&pieces, file.offset_in_torrent, file.length)?;
                backend.set_file_priority(file.index, FilePriority::Ignore);
                Ok(Arc::new(TorrentFileEntry::new(
                    file,
                    matched,
                    Arc::clone(&lifecycle),
                )))
            })
            .collect::<Result<Vec<_>, TorrentError>>()?;

        debug!(
            files = entries.len(),
            pieces = pieces.len(),
            save_directory = %backend.save_directory().display(),
            "Opened torrent session"
        );

        Ok(Self { lifecycle, entries })
    }

    pub fn entries(&self) -> &[Arc<TorrentFileEntry>] {
        &self.entries
    }

    /// # Errors
    ///
    /// - `TorrentError::FileNotFound` - No file has this index
    pub fn entry(&self, index: usize) -> Result<&Arc<TorrentFileEntry>, TorrentError> {
        self.entries
            .iter()
            .find(|entry| entry.index() == index)
            .ok_or(TorrentError::FileNotFound { index })
    }

    pub fn find_entry(&self, path_in_torrent: &str) -> Option<&Arc<TorrentFileEntry>> {
        self.entries
            .iter()
            .find(|entry| entry.path_in_torrent() == path_in_torrent)
    }

    pub fn save_directory(&self) -> PathBuf {
        self.lifecycle.backend().save_directory()
    }

    pub fn stats(&self) -> watch::Receiver<SessionStats> {
        self.lifecycle.backend().stats()
    }

    pub fn open_handle_count(&self) -> usize {
        self.lifecycle.open_handles()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Closes the session regardless of open handles.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Downloader` - The backend failed to shut down
    pub async fn close(&self) -> Result<(), TorrentError> {
        self.lifecycle.shutdown().await
    }
}
