//! Reading cached files while their pieces arrive.

use std::sync::Arc;
use std::time::Duration;

use mediacache_core::streaming::ReadOutcome;
use mediacache_core::test_utils::{MockSessionBackend, pattern_bytes};
use mediacache_core::torrent::{FilePriority, PieceState, TorrentSession};
use proptest::prelude::*;

#[tokio::test]
async fn test_playback_reads_as_pieces_finish() {
    let backend = MockSessionBackend::single_file("ep.mkv", 1024, 64);
    let session = TorrentSession::open(backend.clone()).unwrap();
    let handle = session.entry(0).unwrap().create_handle().unwrap();
    handle.resume(FilePriority::High).unwrap();
    let expected = pattern_bytes(1024);
    let mut input = handle.create_input(256).unwrap();
    let mut buf = [0u8; 100];

    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::NoDataAvailable);

    backend.set_piece_state(0, PieceState::Finished);
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Read(64));
    assert_eq!(&buf[..64], &expected[..64]);
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::NoDataAvailable);
    assert_eq!(input.position(), 64);

    backend.set_piece_state(1, PieceState::Finished);
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Read(64));
    assert_eq!(&buf[..64], &expected[64..128]);

    backend.finish_all();
    input.seek(1000).unwrap();
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Read(24));
    assert_eq!(&buf[..24], &expected[1000..]);
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);

    input.close();
    handle.close().await.unwrap();
    assert!(backend.is_closed());
}

#[tokio::test]
async fn test_reader_over_file_sharing_pieces_with_neighbours() {
    let backend = MockSessionBackend::multi_file(&[("a.txt", 10), ("b.mkv", 40), ("c.nfo", 30)], 16);
    let session = TorrentSession::open(backend.clone()).unwrap();
    let handle = session.find_entry("b.mkv").unwrap().create_handle().unwrap();
    let expected = pattern_bytes(40);
    let mut input = handle.create_input(32).unwrap();
    let mut buf = [0u8; 64];

    // b.mkv spans torrent bytes 10..50; piece 0 also holds a.txt.
    backend.set_piece_state(0, PieceState::Finished);
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Read(6));
    assert_eq!(&buf[..6], &expected[..6]);

    for piece in 1..=3 {
        backend.set_piece_state(piece, PieceState::Finished);
    }
    let mut collected = buf[..6].to_vec();
    loop {
        match input.read(&mut buf).unwrap() {
            ReadOutcome::Read(n) => collected.extend_from_slice(&buf[..n]),
            ReadOutcome::EndOfStream => break,
            ReadOutcome::NoDataAvailable => panic!("all pieces of b.mkv are finished"),
        }
    }
    assert_eq!(collected, expected);

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_waiting_reader_wakes_when_piece_finishes() {
    let backend = MockSessionBackend::single_file("ep.mkv", 512, 128);
    let session = TorrentSession::open(backend.clone()).unwrap();
    let handle = Arc::new(session.entry(0).unwrap().create_handle().unwrap());
    let mut input = handle.create_input(128).unwrap();
    input.seek(300).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::NoDataAvailable);

    let waiter = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { handle.wait_available(300).await })
    };
    backend.set_piece_state(2, PieceState::Finished);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Read(16));
    assert_eq!(&buf[..], &pattern_bytes(512)[300..316]);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_last_handle_closes_session() {
    let backend = MockSessionBackend::single_file("ep.mkv", 256, 64);
    let session = TorrentSession::open(backend.clone()).unwrap();
    let handle = session.entry(0).unwrap().create_handle().unwrap();

    drop(handle);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !backend.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(backend.close_count(), 1);
}

proptest! {
    #[test]
    fn prop_seeking_anywhere_reproduces_file_bytes(
        positions in proptest::collection::vec(0u64..700, 1..20),
        buffer_size in 0usize..300,
    ) {
        let backend = MockSessionBackend::single_file("ep.mkv", 700, 32);
        backend.finish_all();
        let session = TorrentSession::open(backend.clone()).unwrap();
        let handle = session.entry(0).unwrap().create_handle().unwrap();
        let mut input = handle.create_input(buffer_size).unwrap();
        let expected = pattern_bytes(700);
        let mut buf = [0u8; 48];

        for position in positions {
            input.seek(position).unwrap();
            match input.read(&mut buf).unwrap() {
                ReadOutcome::Read(n) => {
                    let start = position as usize;
                    prop_assert_eq!(&buf[..n], &expected[start..start + n]);
                }
                other => prop_assert!(false, "unexpected {:?} at {}", other, position),
            }
        }
    }
}
