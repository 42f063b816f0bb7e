//! Torrent pieces with observable download state.
//!
//! A piece is identified by its index, byte offset within the torrent and
//! size. Only the state changes over its lifetime; the engine publishes state
//! updates and any number of readers observe them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::PieceIndex;

/// Download state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceState {
    /// Known to the engine but not requested yet
    Ready,
    /// At least one block has been requested
    Downloading,
    /// Downloaded and verified, bytes may be read from disk
    Finished,
    /// No peer is able to provide this piece
    NotAvailable,
}

impl PieceState {
    /// Returns true if the piece bytes are on disk and verified.
    pub fn is_finished(self) -> bool {
        matches!(self, PieceState::Finished)
    }
}

/// A contiguous chunk of torrent data.
///
/// Offsets are relative to the start of the whole torrent, not to any file.
pub struct Piece {
    index: PieceIndex,
    offset: u64,
    size: u64,
    state: watch::Sender<PieceState>,
}

impl Piece {
    /// Creates a piece in the `Ready` state.
    pub fn new(index: u32, offset: u64, size: u64) -> Self {
        Self::with_state(index, offset, size, PieceState::Ready)
    }

    /// Creates a piece with an explicit initial state.
    pub fn with_state(index: u32, offset: u64, size: u64, state: PieceState) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            index: PieceIndex::new(index),
            offset,
            size,
            state,
        }
    }

    /// Builds consecutive pieces covering `total_size` bytes.
    ///
    /// Every piece is `piece_size` bytes except the last one, which holds the
    /// remainder. The first piece starts at `initial_offset`.
    pub fn build_pieces(total_size: u64, piece_size: u64, initial_offset: u64) -> Vec<Arc<Piece>> {
        if piece_size == 0 {
            return Vec::new();
        }

        let count = total_size.div_ceil(piece_size);
        (0..count)
            .map(|i| {
                let start = i * piece_size;
                let size = piece_size.min(total_size - start);
                Arc::new(Piece::new(i as u32, initial_offset + start, size))
            })
            .collect()
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Byte offset of the first byte of this piece within the torrent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end offset within the torrent.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Returns the latest published state.
    pub fn state(&self) -> PieceState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Publishes a new state to all observers.
    ///
    /// Only the engine that owns the piece should call this.
    pub fn set_state(&self, state: PieceState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PieceState> {
        self.state.subscribe()
    }

    /// Waits until the piece reaches `Finished`.
    ///
    /// Returns immediately if it already has.
    pub async fn wait_finished(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = receiver.wait_for(|state| state.is_finished()).await;
    }
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index.as_u32())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_build_pieces_last_piece_holds_remainder() {
        let pieces = Piece::build_pieces(40, 16, 100);

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].offset(), 100);
        assert_eq!(pieces[1].offset(), 116);
        assert_eq!(pieces[2].offset(), 132);
        assert_eq!(pieces[2].size(), 8);
        assert_eq!(pieces[2].end(), 140);
        assert!(pieces.iter().all(|p| p.state() == PieceState::Ready));
    }

    #[test]
    fn test_build_pieces_zero_piece_size() {
        assert!(Piece::build_pieces(40, 0, 0).is_empty());
    }

    #[test]
    fn test_state_updates_are_observed() {
        let piece = Piece::new(0, 0, 16);
        let receiver = piece.subscribe();

        piece.set_state(PieceState::Downloading);
        assert_eq!(*receiver.borrow(), PieceState::Downloading);

        piece.set_state(PieceState::Finished);
        assert!(piece.is_finished());
    }

    #[tokio::test]
    async fn test_wait_finished_resumes_after_completion() {
        let piece = Arc::new(Piece::new(0, 0, 16));
        let waiter = {
            let piece = Arc::clone(&piece);
            tokio::spawn(async move { piece.wait_finished().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        piece.set_state(PieceState::Finished);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
