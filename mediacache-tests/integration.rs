//! Integration tests for mediacache
//!
//! Exercise the torrent engine, storages, manager and request protocol
//! together against the in-memory downloader.

#[path = "integration/fixtures.rs"]
mod fixtures;

#[path = "integration/request_flow.rs"]
mod request_flow;
#[path = "integration/restore_roundtrip.rs"]
mod restore_roundtrip;
#[path = "integration/streaming_playback.rs"]
mod streaming_playback;
