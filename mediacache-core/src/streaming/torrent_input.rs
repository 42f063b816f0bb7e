//! Buffered random-access reader over a file that downloads piece by piece.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::Arc;

use tracing::trace;

use crate::torrent::Piece;

/// Errors raised by [`TorrentInput`].
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// Caller passed a negative position or an out-of-bounds slice.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Input is closed")]
    Closed,

    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Result of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the destination
    Read(usize),
    /// The piece covering the position has not finished downloading
    NoDataAvailable,
    /// The position is at or past the end of the file
    EndOfStream,
}

/// Seekable reader over a file whose bytes become available piece by piece.
///
/// Positions are logical: `0` is the first byte of the file. Pieces are
/// addressed in torrent offsets, and `logical_start_offset` is the torrent
/// offset of the file's first byte, so leading bytes of the first piece that
/// belong to a neighbouring file are skipped.
///
/// Reads are served from an in-memory window around the position. The window
/// only ever spans finished pieces; when it moves, bytes shared with the
/// previous window are moved in memory and only the difference is read from
/// the source.
pub struct TorrentInput<R> {
    source: Option<R>,
    pieces: Arc<[Arc<Piece>]>,
    logical_start_offset: u64,
    size: u64,
    buffer_size: usize,
    position: u64,
    buffer: Vec<u8>,
    buffered: Range<u64>,
    source_bytes_read: u64,
}

impl<R: Read + Seek> TorrentInput<R> {
    /// Creates a reader over `size` bytes of `source`.
    ///
    /// `buffer_size` is the total window; half of it is kept behind the
    /// position and the rest ahead of it.
    pub fn new(
        source: R,
        pieces: Arc<[Arc<Piece>]>,
        logical_start_offset: u64,
        size: u64,
        buffer_size: usize,
    ) -> Self {
        Self {
            source: Some(source),
            pieces,
            logical_start_offset,
            size,
            buffer_size,
            position: 0,
            buffer: Vec::new(),
            buffered: 0..0,
            source_bytes_read: 0,
        }
    }

    /// Logical size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical byte range currently held in memory.
    pub fn buffered_offset_range(&self) -> Range<u64> {
        self.buffered.clone()
    }

    /// Total bytes fetched from the underlying source so far.
    pub fn source_bytes_read(&self) -> u64 {
        self.source_bytes_read
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    fn ensure_open(&self) -> Result<(), InputError> {
        if self.source.is_none() {
            Err(InputError::Closed)
        } else {
            Ok(())
        }
    }

    /// Moves to an absolute logical position.
    ///
    /// Seeking past the end is allowed; subsequent reads report end of stream.
    ///
    /// # Errors
    ///
    /// - `InputError::Closed` - The input was closed
    pub fn seek(&mut self, position: u64) -> Result<(), InputError> {
        self.ensure_open()?;
        self.position = position;
        Ok(())
    }

    /// Moves relative to the current position.
    ///
    /// # Errors
    ///
    /// - `InputError::Closed` - The input was closed
    /// - `InputError::InvalidArgument` - The resulting position is negative
    pub fn seek_relative(&mut self, delta: i64) -> Result<u64, InputError> {
        self.ensure_open()?;
        let target = self
            .position
            .checked_add_signed(delta)
            .ok_or_else(|| InputError::InvalidArgument {
                reason: format!("seek by {delta} from {} is out of range", self.position),
            })?;
        self.position = target;
        Ok(target)
    }

    /// Reads into `dest` starting at the current position.
    ///
    /// Never blocks on missing pieces: if the byte at the position is not
    /// downloaded yet, returns `NoDataAvailable` without moving.
    ///
    /// # Errors
    ///
    /// - `InputError::Closed` - The input was closed
    /// - `InputError::Io` - Reading the source failed
    pub fn read(&mut self, dest: &mut [u8]) -> Result<ReadOutcome, InputError> {
        self.ensure_open()?;

        let position = self.position;
        if position >= self.size {
            return Ok(ReadOutcome::EndOfStream);
        }
        if dest.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }

        if !self.buffered.contains(&position) {
            self.prepare_buffer()?;
        }

        if self.buffered.contains(&position) {
            let start = (position - self.buffered.start) as usize;
            let count = dest.len().min((self.buffered.end - position) as usize);
            dest[..count].copy_from_slice(&self.buffer[start..start + count]);
            self.position += count as u64;
            return Ok(ReadOutcome::Read(count));
        }

        // The window could not cover the position, either because the piece
        // is missing or because buffering is disabled.
        let available = self.compute_max_buffer_size_forward(position, dest.len() as u64);
        if available == 0 {
            return Ok(ReadOutcome::NoDataAvailable);
        }

        let count = available as usize;
        self.read_source(position, 0..count, Target::Dest(dest))?;
        self.position += available;
        Ok(ReadOutcome::Read(count))
    }

    /// Reads at most `length` bytes into `dest[offset..offset + length]`.
    ///
    /// # Errors
    ///
    /// - `InputError::InvalidArgument` - The slice lies outside `dest`
    /// - `InputError::Closed` - The input was closed
    /// - `InputError::Io` - Reading the source failed
    pub fn read_into(
        &mut self,
        dest: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, InputError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= dest.len())
            .ok_or_else(|| InputError::InvalidArgument {
                reason: format!(
                    "offset {offset} + length {length} exceeds buffer of {}",
                    dest.len()
                ),
            })?;
        self.read(&mut dest[offset..end])
    }

    /// Refills the window around the current position.
    ///
    /// Returns the new buffered range, which is empty when nothing around the
    /// position is downloaded or the position is past the end.
    ///
    /// # Errors
    ///
    /// - `InputError::Closed` - The input was closed
    /// - `InputError::Io` - Reading the source failed
    pub fn prepare_buffer(&mut self) -> Result<Range<u64>, InputError> {
        self.ensure_open()?;

        let position = self.position;
        if position >= self.size || self.buffer_size == 0 {
            self.buffered = position..position;
            self.buffer.clear();
            return Ok(self.buffered.clone());
        }

        let behind = self.compute_max_buffer_size_backward(position, (self.buffer_size / 2) as u64);
        let ahead =
            self.compute_max_buffer_size_forward(position, self.buffer_size as u64 - behind);
        let target = position - behind..position + ahead;

        self.fill_buffer(target)?;
        Ok(self.buffered.clone())
    }

    fn fill_buffer(&mut self, target: Range<u64>) -> Result<(), InputError> {
        let previous = self.buffered.clone();
        let new_len = (target.end - target.start) as usize;
        let overlap = target.start.max(previous.start)..target.end.min(previous.end);

        if overlap.start < overlap.end {
            // Move the shared bytes to their place in the new window.
            if self.buffer.len() < new_len {
                self.buffer.resize(new_len, 0);
            }
            let from = (overlap.start - previous.start) as usize;
            let to = (overlap.start - target.start) as usize;
            let count = (overlap.end - overlap.start) as usize;
            self.buffer.copy_within(from..from + count, to);
            self.buffer.truncate(new_len);

            let before = 0..to;
            let after = to + count..new_len;
            if !before.is_empty() {
                self.read_source(target.start, before, Target::Buffer)?;
            }
            if !after.is_empty() {
                self.read_source(overlap.end, after, Target::Buffer)?;
            }
            trace!(
                reused = count,
                window = ?target,
                "Reused buffered bytes"
            );
        } else {
            self.buffer.clear();
            self.buffer.resize(new_len, 0);
            if new_len > 0 {
                self.read_source(target.start, 0..new_len, Target::Buffer)?;
            }
        }

        self.buffered = target;
        Ok(())
    }

    fn read_source(
        &mut self,
        logical_position: u64,
        range: Range<usize>,
        target: Target<'_>,
    ) -> Result<(), InputError> {
        let source = self.source.as_mut().ok_or(InputError::Closed)?;
        let dest = match target {
            Target::Buffer => &mut self.buffer[range.clone()],
            Target::Dest(dest) => &mut dest[range.clone()],
        };
        source.seek(SeekFrom::Start(logical_position))?;
        source.read_exact(dest)?;
        self.source_bytes_read += range.len() as u64;
        Ok(())
    }

    /// Closes the input and releases the source. Idempotent.
    pub fn close(&mut self) {
        self.source = None;
        self.buffer = Vec::new();
        self.buffered = self.position..self.position;
    }
}

enum Target<'a> {
    Buffer,
    Dest(&'a mut [u8]),
}

impl<R> TorrentInput<R> {
    fn piece_logical_start(&self, piece: &Piece) -> u64 {
        piece.offset().saturating_sub(self.logical_start_offset)
    }

    fn piece_logical_end(&self, piece: &Piece) -> u64 {
        piece.end().saturating_sub(self.logical_start_offset)
    }

    /// Index into the piece slice of the piece holding `logical_offset`.
    pub fn find_piece_index(&self, logical_offset: u64) -> Option<usize> {
        let target = self.logical_start_offset + logical_offset;
        let index = self.pieces.partition_point(|piece| piece.end() <= target);
        self.pieces
            .get(index)
            .filter(|piece| piece.offset() <= target)
            .map(|_| index)
    }

    /// Number of downloaded bytes from `position` onwards, at most `limit`.
    ///
    /// Stops at the first unfinished piece or the end of the file.
    pub fn compute_max_buffer_size_forward(&self, position: u64, limit: u64) -> u64 {
        if position >= self.size || limit == 0 {
            return 0;
        }
        let Some(first) = self.find_piece_index(position) else {
            return 0;
        };

        let mut end = position;
        for piece in &self.pieces[first..] {
            if !piece.is_finished() {
                break;
            }
            end = self.piece_logical_end(piece).min(self.size);
            if end - position >= limit || end >= self.size {
                break;
            }
        }
        (end - position).min(limit)
    }

    /// Number of downloaded bytes before `position`, at most `limit`.
    ///
    /// Stops at the first unfinished piece or the start of the file.
    pub fn compute_max_buffer_size_backward(&self, position: u64, limit: u64) -> u64 {
        let position = position.min(self.size);
        if position == 0 || limit == 0 {
            return 0;
        }
        let Some(last) = self.find_piece_index(position - 1) else {
            return 0;
        };

        let mut start = position;
        for piece in self.pieces[..=last].iter().rev() {
            if !piece.is_finished() {
                break;
            }
            start = self.piece_logical_start(piece);
            if position - start >= limit || start == 0 {
                break;
            }
        }
        (position - start).min(limit)
    }
}

impl<R: Read + Seek> Read for TorrentInput<R> {
    /// Adapts to `std::io::Read`; missing pieces surface as `WouldBlock`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match TorrentInput::read(self, buf) {
            Ok(ReadOutcome::Read(count)) => Ok(count),
            Ok(ReadOutcome::EndOfStream) => Ok(0),
            Ok(ReadOutcome::NoDataAvailable) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "piece not downloaded yet",
            )),
            Err(InputError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

impl<R: Read + Seek> Seek for TorrentInput<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = match pos {
            SeekFrom::Start(position) => TorrentInput::seek(self, position).map(|()| position),
            SeekFrom::Current(delta) => self.seek_relative(delta),
            SeekFrom::End(delta) => {
                let delta_from_current = i128::from(self.size) + i128::from(delta)
                    - i128::from(self.position);
                i64::try_from(delta_from_current)
                    .map_err(|_| InputError::InvalidArgument {
                        reason: format!("seek to end{delta:+} is out of range"),
                    })
                    .and_then(|delta| self.seek_relative(delta))
            }
        };
        result.map_err(|e| match e {
            InputError::InvalidArgument { reason } => {
                io::Error::new(io::ErrorKind::InvalidInput, reason)
            }
            InputError::Io(e) => e,
            other => io::Error::other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::sample_text;
    use crate::torrent::PieceState;

    const PIECE_SIZE: u64 = 16;

    fn build_input(
        shift: u64,
        finished: &[usize],
        buffer_size: usize,
    ) -> (TorrentInput<Cursor<Vec<u8>>>, Vec<Arc<Piece>>) {
        let text = sample_text();
        let pieces = Piece::build_pieces(text.len() as u64, PIECE_SIZE, shift);
        for index in finished {
            pieces[*index].set_state(PieceState::Finished);
        }
        let size = text.len() as u64;
        let input = TorrentInput::new(
            Cursor::new(text),
            pieces.clone().into(),
            shift,
            size,
            buffer_size,
        );
        (input, pieces)
    }

    #[test]
    fn test_sample_text_is_576_bytes() {
        assert_eq!(sample_text().len(), 576);
    }

    #[test]
    fn test_read_first_finished_piece() {
        let (mut input, _) = build_input(0, &[0], 8192);
        let mut dest = vec![0u8; 64];

        let outcome = input.read(&mut dest).unwrap();

        assert_eq!(outcome, ReadOutcome::Read(16));
        assert_eq!(&dest[..16], b"Lorem Ipsum is s");
        assert_eq!(input.position(), 16);
    }

    #[test]
    fn test_read_with_logical_shift() {
        let (mut input, _) = build_input(1000, &[0, 1], 16);
        let mut dest = vec![0u8; 8];

        input.seek(16).unwrap();
        let outcome = input.read(&mut dest).unwrap();

        assert_eq!(outcome, ReadOutcome::Read(8));
        assert_eq!(&dest, b"imply du");
        assert_eq!(input.buffered_offset_range(), 8..24);
    }

    #[test]
    fn test_read_waits_for_unfinished_piece() {
        let text = sample_text();
        let (mut input, pieces) = build_input(0, &[0, 1], 64);
        let mut dest = vec![0u8; 8];

        input.seek(40).unwrap();
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::NoDataAvailable);
        assert_eq!(input.position(), 40);

        pieces[2].set_state(PieceState::Finished);
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::Read(8));
        assert_eq!(&dest[..], &text[40..48]);
    }

    #[test]
    fn test_read_stops_at_unfinished_piece() {
        let text = sample_text();
        let (mut input, _) = build_input(0, &[0, 1], 8192);
        let mut dest = vec![0u8; 100];

        input.seek(20).unwrap();
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::Read(12));
        assert_eq!(&dest[..12], &text[20..32]);
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::NoDataAvailable);
    }

    #[test]
    fn test_read_past_end_is_end_of_stream() {
        let (mut input, _) = build_input(0, &[], 64);
        let mut dest = vec![0u8; 8];

        input.seek(10_000).unwrap();
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::EndOfStream);
        assert_eq!(input.prepare_buffer().unwrap(), 10_000..10_000);
    }

    #[test]
    fn test_read_whole_file_to_end() {
        let text = sample_text();
        let all: Vec<usize> = (0..36).collect();
        let (mut input, _) = build_input(0, &all, 100);

        let mut collected = Vec::new();
        let mut dest = vec![0u8; 37];
        loop {
            match input.read(&mut dest).unwrap() {
                ReadOutcome::Read(count) => collected.extend_from_slice(&dest[..count]),
                ReadOutcome::EndOfStream => break,
                ReadOutcome::NoDataAvailable => panic!("every piece is finished"),
            }
        }
        assert_eq!(collected, text);
    }

    #[test]
    fn test_zero_length_read_is_noop() {
        let (mut input, _) = build_input(0, &[0], 64);
        assert_eq!(input.read(&mut []).unwrap(), ReadOutcome::Read(0));
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn test_zero_buffer_reads_directly() {
        let (mut input, _) = build_input(0, &[0], 0);
        let mut dest = vec![0u8; 32];

        assert_eq!(input.prepare_buffer().unwrap(), 0..0);
        assert_eq!(input.read(&mut dest).unwrap(), ReadOutcome::Read(16));
        assert_eq!(&dest[..16], b"Lorem Ipsum is s");
    }

    #[test]
    fn test_read_into_rejects_out_of_bounds_slice() {
        let (mut input, _) = build_input(0, &[0], 64);
        let mut dest = vec![0u8; 8];

        let result = input.read_into(&mut dest, 4, 8);
        assert!(matches!(result, Err(InputError::InvalidArgument { .. })));

        let outcome = input.read_into(&mut dest, 4, 4).unwrap();
        assert_eq!(outcome, ReadOutcome::Read(4));
        assert_eq!(&dest[4..], b"Lore");
    }

    #[test]
    fn test_negative_seek_is_invalid_argument() {
        let (mut input, _) = build_input(0, &[0], 64);
        input.seek(4).unwrap();

        let result = input.seek_relative(-5);
        assert!(matches!(result, Err(InputError::InvalidArgument { .. })));
        assert_eq!(input.seek_relative(-4).unwrap(), 0);

        let io_result = Seek::seek(&mut input, SeekFrom::Current(-1));
        assert_eq!(io_result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (mut input, _) = build_input(0, &[0], 64);
        input.close();
        input.close();

        assert!(matches!(input.seek(0), Err(InputError::Closed)));
        assert!(matches!(input.read(&mut [0u8; 4]), Err(InputError::Closed)));
        assert!(matches!(input.prepare_buffer(), Err(InputError::Closed)));
    }

    #[test]
    fn test_find_piece_index_with_garbage_prefix() {
        // File starts 4 bytes into the first piece.
        let pieces = Piece::build_pieces(64, PIECE_SIZE, 96);
        let input = TorrentInput::new(Cursor::new(vec![0u8; 50]), pieces.into(), 100, 50, 64);

        assert_eq!(input.find_piece_index(0), Some(0));
        assert_eq!(input.find_piece_index(11), Some(0));
        assert_eq!(input.find_piece_index(12), Some(1));
        assert_eq!(input.find_piece_index(59), Some(3));
        assert_eq!(input.find_piece_index(60), None);
    }

    #[test]
    fn test_availability_with_garbage_prefix() {
        let pieces = Piece::build_pieces(64, PIECE_SIZE, 96);
        pieces[0].set_state(PieceState::Finished);
        pieces[1].set_state(PieceState::Finished);
        let input = TorrentInput::new(Cursor::new(vec![0u8; 50]), pieces.into(), 100, 50, 64);

        // Piece 0 covers logical 0..12, piece 1 covers 12..28.
        assert_eq!(input.compute_max_buffer_size_forward(0, u64::MAX), 28);
        assert_eq!(input.compute_max_buffer_size_forward(5, 10), 10);
        assert_eq!(input.compute_max_buffer_size_backward(20, u64::MAX), 20);
        assert_eq!(input.compute_max_buffer_size_backward(0, u64::MAX), 0);
        assert_eq!(input.compute_max_buffer_size_forward(28, u64::MAX), 0);
    }

    #[test]
    fn test_forward_window_clipped_to_file_size() {
        let pieces = Piece::build_pieces(64, PIECE_SIZE, 0);
        for piece in &pieces {
            piece.set_state(PieceState::Finished);
        }
        // Last piece carries 14 bytes of the next file.
        let input = TorrentInput::new(Cursor::new(vec![0u8; 50]), pieces.into(), 0, 50, 64);

        assert_eq!(input.compute_max_buffer_size_forward(40, u64::MAX), 10);
    }

    #[test]
    fn test_sequential_reads_reuse_buffer() {
        let all: Vec<usize> = (0..36).collect();
        let (mut input, _) = build_input(0, &all, 64);
        let mut dest = vec![0u8; 16];

        input.seek(100).unwrap();
        input.read(&mut dest).unwrap();
        assert_eq!(input.source_bytes_read(), 64);
        assert_eq!(input.buffered_offset_range(), 68..132);

        // Moving the window by 40 bytes reuses the 24 shared bytes.
        input.seek(140).unwrap();
        input.read(&mut dest).unwrap();
        assert_eq!(input.buffered_offset_range(), 108..172);
        assert_eq!(input.source_bytes_read(), 64 + 40);
    }

    #[test]
    fn test_seek_back_into_buffer_matches_source() {
        let text = sample_text();
        let all: Vec<usize> = (0..36).collect();
        let (mut input, _) = build_input(0, &all, 64);
        let mut first = vec![0u8; 24];
        let mut again = vec![0u8; 24];

        input.seek(200).unwrap();
        input.read(&mut first).unwrap();
        input.seek(230).unwrap();
        input.read(&mut again).unwrap();
        input.seek(200).unwrap();
        let outcome = input.read(&mut again).unwrap();

        let ReadOutcome::Read(count) = outcome else {
            panic!("expected data, got {outcome:?}");
        };
        assert_eq!(&again[..count], &first[..count]);
        assert_eq!(&again[..count], &text[200..200 + count]);
    }

    #[test]
    fn test_std_io_read_maps_missing_piece_to_would_block() {
        let (mut input, _) = build_input(0, &[0], 64);
        let mut dest = vec![0u8; 32];

        assert_eq!(Read::read(&mut input, &mut dest).unwrap(), 16);
        let error = Read::read(&mut input, &mut dest).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
    }

    proptest! {
        #[test]
        fn prop_forward_window_never_crosses_unfinished_piece(
            finished in proptest::collection::vec(any::<bool>(), 36),
            position in 0u64..600,
        ) {
            let text = sample_text();
            let pieces = Piece::build_pieces(text.len() as u64, PIECE_SIZE, 0);
            for (piece, done) in pieces.iter().zip(&finished) {
                if *done {
                    piece.set_state(PieceState::Finished);
                }
            }
            let size = text.len() as u64;
            let input = TorrentInput::new(Cursor::new(text), pieces.clone().into(), 0, size, 64);

            let available = input.compute_max_buffer_size_forward(position, u64::MAX);
            let first_missing = pieces
                .iter()
                .filter(|p| !p.is_finished() && p.end() > position)
                .map(|p| p.offset().max(position))
                .min()
                .unwrap_or(size);
            prop_assert!(position + available <= first_missing.min(size).max(position));
        }

        #[test]
        fn prop_buffered_reads_match_source(
            seeks in proptest::collection::vec(0u64..576, 1..20),
            buffer_size in 1usize..128,
        ) {
            let text = sample_text();
            let all: Vec<usize> = (0..36).collect();
            let (mut input, _) = build_input(0, &all, buffer_size);
            let mut dest = vec![0u8; 20];

            for position in seeks {
                input.seek(position).unwrap();
                if let ReadOutcome::Read(count) = input.read(&mut dest).unwrap() {
                    let start = position as usize;
                    prop_assert_eq!(&dest[..count], &text[start..start + count]);
                }
            }
        }
    }
}
