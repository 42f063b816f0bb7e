//! Files within a torrent and the handles that keep them downloading.
//!
//! Any number of handles may be open on one file. Each handle requests a
//! priority, or none while paused; the file downloads at the highest
//! requested priority. Closing the last handle of a session closes the
//! session and waits for it to release its resources.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::session::SessionLifecycle;
use super::{Piece, TorrentError, TorrentFileInfo};
use crate::stats::FileStats;
use crate::streaming::TorrentInput;

/// Download priority of a file, ordered from no bandwidth to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum FilePriority {
    /// Not downloaded at all
    #[default]
    Ignore,
    Low,
    Normal,
    /// Needed for current playback
    High,
}

/// One file of a torrent with the pieces that cover it.
pub struct TorrentFileEntry {
    info: TorrentFileInfo,
    pieces: Arc<[Arc<Piece>]>,
    lifecycle: Arc<SessionLifecycle>,
    handles: Mutex<HashMap<u64, Option<FilePriority>>>,
    next_handle_id: AtomicU64,
}

impl TorrentFileEntry {
    pub(crate) fn new(
        info: TorrentFileInfo,
        pieces: Vec<Arc<Piece>>,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Self {
        Self {
            info,
            pieces: pieces.into(),
            lifecycle,
            handles: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn length(&self) -> u64 {
        self.info.length
    }

    pub fn path_in_torrent(&self) -> &str {
        &self.info.path_in_torrent
    }

    pub fn offset_in_torrent(&self) -> u64 {
        self.info.offset_in_torrent
    }

    /// Contiguous pieces overlapping this file, sorted by offset.
    pub fn pieces(&self) -> &Arc<[Arc<Piece>]> {
        &self.pieces
    }

    /// Location of the file on disk.
    pub fn file_path(&self) -> PathBuf {
        self.lifecycle.backend().file_path(self.info.index)
    }

    /// Opens a new handle. The handle starts paused.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - The owning session is shutting down
    pub fn create_handle(self: &Arc<Self>) -> Result<TorrentFileHandle, TorrentError> {
        self.lifecycle.acquire()?;
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(id, None);

        trace!(file = %self.info.path_in_torrent, handle = id, "Created file handle");

        Ok(TorrentFileHandle {
            id,
            entry: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Highest priority requested by any live handle.
    pub fn effective_priority(&self) -> FilePriority {
        effective_priority(&self.handles.lock())
    }

    /// Number of verified bytes that belong to this file.
    pub fn downloaded_bytes(&self) -> u64 {
        let start = self.info.offset_in_torrent;
        let end = start + self.info.length;
        self.pieces
            .iter()
            .filter(|piece| piece.is_finished())
            .map(|piece| piece.end().min(end).saturating_sub(piece.offset().max(start)))
            .sum()
    }

    /// Snapshot of this file's progress combined with session transfer rates.
    pub fn stats(&self) -> FileStats {
        let session = *self.lifecycle.backend().stats().borrow();
        FileStats::new(
            Some(self.info.length),
            self.downloaded_bytes(),
            session.download_speed,
            session.upload_speed,
        )
    }

    fn set_handle_priority(&self, handle_id: u64, priority: Option<FilePriority>) {
        let mut handles = self.handles.lock();
        if let Some(requested) = handles.get_mut(&handle_id) {
            *requested = priority;
        }
        self.push_priority(&handles);
    }

    fn remove_handle(&self, handle_id: u64) {
        let mut handles = self.handles.lock();
        handles.remove(&handle_id);
        self.push_priority(&handles);
    }

    // Called with the handle map locked so pushes reach the backend in order.
    fn push_priority(&self, handles: &HashMap<u64, Option<FilePriority>>) {
        let priority = effective_priority(handles);
        debug!(
            file = %self.info.path_in_torrent,
            ?priority,
            handles = handles.len(),
            "Updating file priority"
        );
        self.lifecycle
            .backend()
            .set_file_priority(self.info.index, priority);
    }
}

fn effective_priority(handles: &HashMap<u64, Option<FilePriority>>) -> FilePriority {
    handles
        .values()
        .flatten()
        .copied()
        .max()
        .unwrap_or(FilePriority::Ignore)
}

/// A capability to download and read one torrent file.
pub struct TorrentFileHandle {
    id: u64,
    entry: Arc<TorrentFileEntry>,
    closed: AtomicBool,
}

impl TorrentFileHandle {
    pub fn entry(&self) -> &Arc<TorrentFileEntry> {
        &self.entry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), TorrentError> {
        if self.is_closed() {
            Err(TorrentError::HandleClosed)
        } else {
            Ok(())
        }
    }

    /// Requests that the file downloads with at least `priority`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The handle was closed
    pub fn resume(&self, priority: FilePriority) -> Result<(), TorrentError> {
        self.ensure_open()?;
        self.entry.set_handle_priority(self.id, Some(priority));
        Ok(())
    }

    /// Withdraws this handle's priority request.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The handle was closed
    pub fn pause(&self) -> Result<(), TorrentError> {
        self.ensure_open()?;
        self.entry.set_handle_priority(self.id, None);
        Ok(())
    }

    /// Closes the handle. Idempotent.
    ///
    /// If this was the last open handle of the session, waits until the
    /// session has released all of its resources.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Downloader` - The session failed to shut down
    pub async fn close(&self) -> Result<(), TorrentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.entry.remove_handle(self.id);
        self.entry.lifecycle.release().await
    }

    /// Closes the handle and deletes the file from disk.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Downloader` - The session failed to shut down
    /// - `TorrentError::Io` - The file exists but could not be removed
    pub async fn close_and_delete(&self) -> Result<(), TorrentError> {
        self.close().await?;

        let path = self.entry.file_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted torrent file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TorrentError::Io(e)),
        }
    }

    /// Opens a buffered reader over the downloaded file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The handle was closed
    /// - `TorrentError::OpenFile` - The file is not allocated on disk yet
    pub fn create_input(&self, buffer_size: usize) -> Result<TorrentInput<std::fs::File>, TorrentError> {
        self.ensure_open()?;

        let path = self.entry.file_path();
        let file = std::fs::File::open(&path)
            .map_err(|source| TorrentError::OpenFile { path, source })?;

        Ok(TorrentInput::new(
            file,
            Arc::clone(&self.entry.pieces),
            self.entry.offset_in_torrent(),
            self.entry.length(),
            buffer_size,
        ))
    }

    /// Waits until the byte at `position` within the file is downloaded.
    ///
    /// Returns immediately for positions past the end of the file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The handle was closed
    pub async fn wait_available(&self, position: u64) -> Result<(), TorrentError> {
        self.ensure_open()?;
        if position >= self.entry.length() {
            return Ok(());
        }

        let target = self.entry.offset_in_torrent() + position;
        let pieces = &self.entry.pieces;
        let index = pieces.partition_point(|piece| piece.end() <= target);
        if let Some(piece) = pieces.get(index) {
            piece.wait_finished().await;
        }
        Ok(())
    }
}

impl Drop for TorrentFileHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entry.remove_handle(self.id);
            self.entry.lifecycle.release_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::MockSessionBackend;
    use crate::torrent::{PieceState, TorrentSession};

    fn open_session() -> (Arc<MockSessionBackend>, TorrentSession) {
        let backend = MockSessionBackend::single_file("video.mkv", 64, 16);
        let session = TorrentSession::open(backend.clone()).unwrap();
        (backend, session)
    }

    #[tokio::test]
    async fn test_effective_priority_is_max_of_handles() {
        let (backend, session) = open_session();
        let entry = session.entry(0).unwrap();

        let first = entry.create_handle().unwrap();
        let second = entry.create_handle().unwrap();
        assert_eq!(backend.file_priority(0), FilePriority::Ignore);

        first.resume(FilePriority::Low).unwrap();
        second.resume(FilePriority::High).unwrap();
        assert_eq!(entry.effective_priority(), FilePriority::High);
        assert_eq!(backend.file_priority(0), FilePriority::High);

        second.pause().unwrap();
        assert_eq!(backend.file_priority(0), FilePriority::Low);

        first.pause().unwrap();
        assert_eq!(backend.file_priority(0), FilePriority::Ignore);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_handle_removes_its_priority() {
        let (backend, session) = open_session();
        let entry = session.entry(0).unwrap();

        let keeper = entry.create_handle().unwrap();
        let reader = entry.create_handle().unwrap();
        keeper.resume(FilePriority::Normal).unwrap();
        reader.resume(FilePriority::High).unwrap();

        reader.close().await.unwrap();
        assert_eq!(backend.file_priority(0), FilePriority::Normal);
        assert!(!session.is_closed());

        keeper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_close_waits_for_session_shutdown() {
        let (backend, session) = open_session();
        backend.set_close_delay(Duration::from_millis(50));
        let handle = session.entry(0).unwrap().create_handle().unwrap();

        handle.close().await.unwrap();

        assert!(backend.is_closed());
        assert!(session.is_closed());
        assert_eq!(session.open_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_further_use() {
        let (backend, session) = open_session();
        let handle = session.entry(0).unwrap().create_handle().unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(backend.close_count(), 1);
        assert!(matches!(
            handle.resume(FilePriority::High),
            Err(TorrentError::HandleClosed)
        ));
        assert!(matches!(
            session.entry(0).unwrap().create_handle(),
            Err(TorrentError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_downloaded_bytes_clips_shared_pieces() {
        let backend = MockSessionBackend::multi_file(&[("a.txt", 10), ("b.mkv", 40)], 16);
        let session = TorrentSession::open(backend.clone()).unwrap();
        let entry = session.find_entry("b.mkv").unwrap();

        // b.mkv spans 10..50, pieces 0..=3
        backend.set_piece_state(0, PieceState::Finished);
        assert_eq!(entry.downloaded_bytes(), 6);

        backend.set_piece_state(3, PieceState::Finished);
        assert_eq!(entry.downloaded_bytes(), 6 + 2);

        backend.finish_all();
        assert_eq!(entry.downloaded_bytes(), 40);
        assert!(entry.stats().is_finished());
    }

    #[tokio::test]
    async fn test_wait_available_resumes_after_piece_finishes() {
        let (backend, session) = open_session();
        let handle = Arc::new(session.entry(0).unwrap().create_handle().unwrap());

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_available(40).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        backend.set_piece_state(2, PieceState::Finished);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_and_delete_removes_file() {
        let (backend, session) = open_session();
        let handle = session.entry(0).unwrap().create_handle().unwrap();
        let path = handle.entry().file_path();
        assert!(path.exists());

        handle.close_and_delete().await.unwrap();

        assert!(!path.exists());
        assert!(backend.is_closed());
    }
}
