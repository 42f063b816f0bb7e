//! Maps a file's byte range within a torrent to the pieces that cover it.

use std::sync::Arc;

use super::{Piece, TorrentError};

/// Selects the pieces overlapping `[offset, offset + length)`.
///
/// The returned pieces are sorted by offset and validated to be strictly
/// contiguous from `offset` through `offset + length`. A zero length file
/// matches no pieces.
///
/// # Errors
///
/// - `TorrentError::CorruptLayout` - No piece overlaps a non-empty file, the
///   overlapping pieces leave a gap, they stop short of either end of the
///   file, or the range overflows `u64`
pub fn match_pieces_for_file(
    all_pieces: &[Arc<Piece>],
    offset: u64,
    length: u64,
) -> Result<Vec<Arc<Piece>>, TorrentError> {
    if length == 0 {
        return Ok(Vec::new());
    }

    let end = offset
        .checked_add(length)
        .ok_or_else(|| TorrentError::CorruptLayout {
            reason: format!("file range {offset}+{length} overflows"),
        })?;
    let mut pieces: Vec<Arc<Piece>> = all_pieces
        .iter()
        .filter(|piece| piece.offset() < end && piece.end() > offset)
        .cloned()
        .collect();
    pieces.sort_by_key(|piece| piece.offset());

    if pieces.is_empty() {
        return Err(TorrentError::CorruptLayout {
            reason: format!("no pieces overlap file range {offset}..{end}"),
        });
    }

    for window in pieces.windows(2) {
        let (previous, next) = (&window[0], &window[1]);
        if next.offset() != previous.end() {
            return Err(TorrentError::CorruptLayout {
                reason: format!(
                    "piece {} starts at {} but piece {} ends at {}",
                    next.index(),
                    next.offset(),
                    previous.index(),
                    previous.end()
                ),
            });
        }
    }

    let (first, last) = (&pieces[0], &pieces[pieces.len() - 1]);
    if first.offset() > offset || last.end() < end {
        return Err(TorrentError::CorruptLayout {
            reason: format!(
                "pieces cover {}..{}, file needs {offset}..{end}",
                first.offset(),
                last.end()
            ),
        });
    }

    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_file_inside_single_piece() {
        let pieces = Piece::build_pieces(64, 16, 0);
        let matched = match_pieces_for_file(&pieces, 18, 10).unwrap();

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].index().as_u32(), 1);
    }

    #[test]
    fn test_file_spanning_pieces_with_garbage_edges() {
        let pieces = Piece::build_pieces(64, 16, 0);
        let matched = match_pieces_for_file(&pieces, 10, 30).unwrap();

        let indices: Vec<u32> = matched.iter().map(|p| p.index().as_u32()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_file_ending_on_piece_boundary_excludes_next_piece() {
        let pieces = Piece::build_pieces(64, 16, 0);
        let matched = match_pieces_for_file(&pieces, 0, 32).unwrap();

        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_zero_length_file_matches_nothing() {
        let pieces = Piece::build_pieces(64, 16, 0);
        assert!(match_pieces_for_file(&pieces, 20, 0).unwrap().is_empty());
        assert!(match_pieces_for_file(&[], 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let mut pieces = Piece::build_pieces(64, 16, 0);
        pieces.reverse();

        let matched = match_pieces_for_file(&pieces, 0, 64).unwrap();
        let offsets: Vec<u64> = matched.iter().map(|p| p.offset()).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48]);
    }

    #[test]
    fn test_gap_is_corrupt_layout() {
        let pieces = vec![
            Arc::new(Piece::new(0, 0, 16)),
            Arc::new(Piece::new(1, 20, 16)),
        ];

        let result = match_pieces_for_file(&pieces, 0, 30);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    #[test]
    fn test_no_overlap_is_corrupt_layout() {
        let pieces = Piece::build_pieces(64, 16, 0);

        let result = match_pieces_for_file(&pieces, 100, 10);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    #[test]
    fn test_undersized_coverage_is_corrupt_layout() {
        let pieces = Piece::build_pieces(64, 16, 0);

        let result = match_pieces_for_file(&pieces, 32, 64);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    #[test]
    fn test_uncovered_tail_is_corrupt_layout() {
        // Two pieces span 32 bytes, more than the file length, yet stop at 32.
        let pieces = Piece::build_pieces(32, 16, 0);

        let result = match_pieces_for_file(&pieces, 10, 30);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    #[test]
    fn test_uncovered_head_is_corrupt_layout() {
        let pieces = vec![Arc::new(Piece::new(0, 16, 32))];

        let result = match_pieces_for_file(&pieces, 8, 16);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    #[test]
    fn test_overflowing_range_is_corrupt_layout() {
        let pieces = Piece::build_pieces(64, 16, 0);

        let result = match_pieces_for_file(&pieces, u64::MAX - 4, 10);
        assert!(matches!(result, Err(TorrentError::CorruptLayout { .. })));
    }

    proptest! {
        #[test]
        fn prop_matched_pieces_are_contiguous_and_cover_file(
            piece_size in 1u64..64,
            piece_count in 1u64..40,
            start_fraction in 0.0f64..1.0,
            length_fraction in 0.0f64..1.0,
        ) {
            let total = piece_size * piece_count;
            let pieces = Piece::build_pieces(total, piece_size, 0);
            let offset = ((total - 1) as f64 * start_fraction) as u64;
            let length = (((total - offset) as f64) * length_fraction) as u64;

            let matched = match_pieces_for_file(&pieces, offset, length).unwrap();

            if length == 0 {
                prop_assert!(matched.is_empty());
            } else {
                prop_assert!(matched[0].offset() <= offset);
                prop_assert!(matched.last().unwrap().end() >= offset + length);
                for window in matched.windows(2) {
                    prop_assert_eq!(window[1].offset(), window[0].end());
                }
                let covered: u64 = matched.iter().map(|p| p.size()).sum();
                prop_assert!(covered >= length);
            }
        }
    }
}
