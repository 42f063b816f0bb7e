//! Seekable byte sources over partially downloaded torrent files.
//!
//! Pieces arrive in no particular order. [`TorrentInput`] exposes the classic
//! seek/read interface and never touches bytes behind an unfinished piece:
//! a read at such a position reports [`ReadOutcome::NoDataAvailable`] and the
//! caller decides whether to poll or await the piece.

pub mod torrent_input;

pub use torrent_input::{InputError, ReadOutcome, TorrentInput};
