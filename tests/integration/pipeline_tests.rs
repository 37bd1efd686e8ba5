//! Coordinator pipeline integration tests.
//!
//! Tests verify:
//! - File resolution stores an entry and a thumbnail
//! - Concurrent requests for one image share a single generation job
//! - Range requests only generate scales the store is missing
//! - Missing or unreadable tiles inside the stored scale range are regenerated
//! - Decode failures and bad coordinates reach the caller as errors
//! - Deleting, refreshing and changed sources
//! - Cancellation and shutdown

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use tile_depot::config::TILES_DIR_NAME;
use tile_depot::{
    Database, DatabaseConfig, DatabaseTileProvider, FileEntry, FileTileStore, JobState, Size, Surface, Tile,
    TileBackend, TileEncoder, TileError, TileFormat, TilePos, TileProvider,
};

use super::test_utils::{fetch_tile, resolve, spawn_coordinator, spawn_with_database, stop, TestSource, TIMEOUT};

const URL: &str = "/images/large.png";

fn source_with_image() -> Arc<TestSource> {
    let source = TestSource::new();
    source.add_image(URL, 1000, 700);
    source
}

// =============================================================================
// File Resolution
// =============================================================================

#[test]
fn test_resolve_file_stores_entry_and_thumbnail() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());

    let (tx, rx) = flume::unbounded();
    let handle = coordinator.request_file(URL, move |result| tx.send(result.map(|e| e.id())).unwrap(), |_| {});

    let id = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert!(id.is_valid());
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));

    let entry = resolve(&coordinator, URL).unwrap();
    assert_eq!(entry.id(), id);
    assert_eq!(entry.size(), Size::new(1000, 700));
    assert_eq!(entry.max_scale(), 7);
    assert_eq!(entry.format(), TileFormat::Png);

    // The known entry is answered from the database.
    assert_eq!(source.decode_count(URL), 1);

    let thumbnail = fetch_tile(&coordinator, &entry, 7, 0, 0).unwrap();
    assert_eq!(thumbnail.surface().size(), Size::new(7, 5));
    assert_eq!(source.decode_count(URL), 1);

    stop(coordinator);
}

#[test]
fn test_thumbnail_callback_fires_for_known_file() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    resolve(&coordinator, URL).unwrap();

    let (tx, rx) = flume::unbounded();
    coordinator.request_file(URL, |_| {}, move |tile| tx.send(tile).unwrap());
    let thumbnail = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(thumbnail.scale(), 7);
    assert_eq!(thumbnail.pos(), TilePos::new(0, 0));

    stop(coordinator);
}

#[test]
fn test_resolve_missing_source_fails() {
    let source = TestSource::new();
    let coordinator = spawn_coordinator(source);

    let result = resolve(&coordinator, "/does/not/exist.png");
    assert!(matches!(result, Err(TileError::Source { .. })), "{result:?}");

    stop(coordinator);
}

#[test]
fn test_changed_source_is_resolved_again() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let first = resolve(&coordinator, URL).unwrap();
    fetch_tile(&coordinator, &first, 0, 0, 0).unwrap();

    source.touch(URL);
    let second = resolve(&coordinator, URL).unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(second.mtime(), first.mtime() + 1);

    // Tiles of the old entry went with it.
    let (tx, rx) = flume::unbounded();
    coordinator.request_all_files(move |r| tx.send(r).unwrap());
    let entries = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id(), second.id());

    stop(coordinator);
}

// =============================================================================
// Generation
// =============================================================================

#[test]
fn test_first_request_generates_whole_pyramid() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    let source = source_with_image();

    // An entry with no tiles at all, not even a thumbnail.
    let entry = {
        let mut database = Database::open(&config).unwrap();
        let entry = FileEntry::new(URL, 2_100_000, 1_700_000_000, Size::new(1000, 700), TileFormat::Png);
        database.files_mut().store_file_entry(&entry).unwrap()
    };

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let tile = fetch_tile(&coordinator, &entry, 3, 0, 0).unwrap();
    assert_eq!(tile.scale(), 3);
    assert_eq!(tile.surface().size(), Size::new(125, 87));

    // Both ends of the pyramid came out of that one decode.
    fetch_tile(&coordinator, &entry, 0, 3, 2).unwrap();
    fetch_tile(&coordinator, &entry, 7, 0, 0).unwrap();
    assert_eq!(source.decode_count(URL), 1);
    stop(coordinator);

    let database = Database::open(&config).unwrap();
    assert_eq!(database.tiles().get_min_max_scale(entry.id()).unwrap(), Some((0, 7)));
}

#[test]
fn test_concurrent_requests_share_one_job() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    source.hold();
    let (tx, rx) = flume::unbounded();
    let mut handles = Vec::new();
    for (scale, x, y) in [(0, 0, 0), (0, 3, 2), (2, 0, 0), (6, 0, 0)] {
        let tx = tx.clone();
        handles.push(coordinator.request_tile(&entry, scale, TilePos::new(x, y), move |result| {
            tx.send((scale, x, y, result)).unwrap()
        }));
    }
    source.release();

    let mut answers: Vec<_> = (0..4).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    answers.sort_by_key(|(scale, x, y, _)| (*scale, *x, *y));

    let sizes: Vec<Size> = answers
        .into_iter()
        .map(|(_, _, _, result)| result.unwrap().surface().size())
        .collect();
    assert_eq!(
        sizes,
        vec![
            Size::new(256, 256),
            Size::new(232, 188),
            Size::new(250, 175),
            Size::new(15, 10),
        ]
    );

    for handle in handles {
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    }
    // One decode to resolve the file, one shared by all four tiles.
    assert_eq!(source.decode_count(URL), 2);

    stop(coordinator);
}

#[test]
fn test_request_tiles_skips_stored_scales() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    let generated = Arc::new(AtomicUsize::new(0));
    let counter = generated.clone();
    let handle = coordinator.request_tiles(&entry, 5, 7, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    // Scales 5 and 6, one tile each; scale 7 came with the file.
    assert_eq!(generated.load(Ordering::SeqCst), 2);
    assert_eq!(source.decode_count(URL), 2);

    let counter = generated.clone();
    let handle = coordinator.request_tiles(&entry, 0, 7, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    // Scales 0 to 4 add 12 + 4 + 1 + 1 + 1 tiles.
    assert_eq!(generated.load(Ordering::SeqCst), 21);
    assert_eq!(source.decode_count(URL), 3);

    let handle = coordinator.request_tiles(&entry, 0, 40, |_| panic!("nothing left to generate"));
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    assert_eq!(source.decode_count(URL), 3);

    stop(coordinator);
}

#[test]
fn test_stored_tile_is_not_regenerated() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    let first = fetch_tile(&coordinator, &entry, 1, 1, 1).unwrap();
    let second = fetch_tile(&coordinator, &entry, 1, 1, 1).unwrap();
    assert_eq!(first.surface().size(), Size::new(244, 94));
    assert_eq!(second.surface().size(), first.surface().size());
    assert_eq!(source.decode_count(URL), 2);

    stop(coordinator);
}

#[test]
fn test_received_tiles_are_persisted() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    let source = source_with_image();

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    let surface = Surface::from_rgb(RgbImage::from_pixel(256, 256, Rgb([10, 200, 30])));
    coordinator
        .receive_tile(entry.id(), Tile::new(0, TilePos::new(2, 1), surface))
        .unwrap();
    stop(coordinator);

    let database = Database::open(&config).unwrap();
    assert!(database.tiles().has_tile(entry.id(), TilePos::new(2, 1), 0).unwrap());
    assert!(!database.tiles().has_tile(entry.id(), TilePos::new(0, 0), 0).unwrap());
}

#[test]
fn test_tiles_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));

    let source = source_with_image();
    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    fetch_tile(&coordinator, &entry, 0, 1, 1).unwrap();
    stop(coordinator);

    let source = source_with_image();
    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let reopened = resolve(&coordinator, URL).unwrap();
    assert_eq!(reopened.id(), entry.id());

    let tile = fetch_tile(&coordinator, &reopened, 0, 1, 1).unwrap();
    assert_eq!(tile.surface().size(), Size::new(256, 256));
    assert_eq!(source.decode_count(URL), 0);

    stop(coordinator);
}

// =============================================================================
// Stale Bounds
// =============================================================================

fn file_backend(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        backend: TileBackend::Files,
        ..DatabaseConfig::at(dir.path().join("db"))
    }
}

/// Path of a stored tile in the file backend under `dir`.
fn tile_file(dir: &TempDir, entry: &FileEntry, name: &str) -> PathBuf {
    let store = FileTileStore::open(dir.path().join("db").join(TILES_DIR_NAME), TileEncoder::default()).unwrap();
    store.image_directory(entry.id()).join(name)
}

#[test]
fn test_range_inside_bounds_gap_is_generated() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    // Scales 0 to 2 plus the thumbnail at 7 leave a gap at 3 to 6.
    let handle = coordinator.request_tiles(&entry, 0, 2, |_| {});
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    assert_eq!(source.decode_count(URL), 2);

    let generated = Arc::new(AtomicUsize::new(0));
    let counter = generated.clone();
    let handle = coordinator.request_tiles(&entry, 3, 6, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));
    assert_eq!(generated.load(Ordering::SeqCst), 4);
    assert_eq!(source.decode_count(URL), 3);

    let tile = fetch_tile(&coordinator, &entry, 4, 0, 0).unwrap();
    assert_eq!(tile.surface().size(), Size::new(62, 43));
    assert_eq!(source.decode_count(URL), 3);

    stop(coordinator);
}

#[test]
fn test_tiles_waiting_on_other_scales_still_arrive() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    let handle = coordinator.request_tiles(&entry, 0, 2, |_| {});
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));

    source.hold();
    let (tx, rx) = flume::unbounded();
    for scale in 3..=6 {
        let tx = tx.clone();
        coordinator.request_tile(&entry, scale, TilePos::new(0, 0), move |result| {
            tx.send((scale, result)).unwrap()
        });
    }
    source.release();

    let mut answers: Vec<_> = (0..4).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    answers.sort_by_key(|(scale, _)| *scale);
    let sizes: Vec<Size> = answers
        .into_iter()
        .map(|(scale, result)| {
            let tile = result.unwrap_or_else(|e| panic!("scale {scale}: {e}"));
            tile.surface().size()
        })
        .collect();
    assert_eq!(
        sizes,
        vec![
            Size::new(125, 87),
            Size::new(62, 43),
            Size::new(31, 21),
            Size::new(15, 10),
        ]
    );
    // The whole gap came out of a single decode.
    assert_eq!(source.decode_count(URL), 3);

    stop(coordinator);
}

#[test]
fn test_missing_tile_inside_bounds_is_regenerated() {
    let dir = TempDir::new().unwrap();
    let config = file_backend(&dir);
    let source = source_with_image();

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    fetch_tile(&coordinator, &entry, 0, 0, 0).unwrap();
    stop(coordinator);
    assert_eq!(source.decode_count(URL), 2);

    // Bounds still read 0..=7, but scale 2 has lost its only tile.
    let missing = tile_file(&dir, &entry, "tile-2-0-0.jpg");
    fs::remove_file(&missing).unwrap();

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let tile = fetch_tile(&coordinator, &entry, 2, 0, 0).unwrap();
    assert_eq!(tile.surface().size(), Size::new(250, 175));
    assert_eq!(source.decode_count(URL), 3);
    stop(coordinator);

    assert!(missing.is_file());
}

#[test]
fn test_unreadable_stored_tile_is_regenerated() {
    let dir = TempDir::new().unwrap();
    let config = file_backend(&dir);
    let source = source_with_image();

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    fetch_tile(&coordinator, &entry, 0, 0, 0).unwrap();
    stop(coordinator);

    fs::write(tile_file(&dir, &entry, "tile-0-0-0.jpg"), b"not a jpeg").unwrap();

    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let tile = fetch_tile(&coordinator, &entry, 0, 0, 0).unwrap();
    assert_eq!(tile.surface().size(), Size::new(256, 256));
    assert_eq!(source.decode_count(URL), 3);

    // Once rewritten, the tile is served from the store again.
    fetch_tile(&coordinator, &entry, 0, 0, 0).unwrap();
    assert_eq!(source.decode_count(URL), 3);
    stop(coordinator);
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_decode_failure_reaches_every_waiter() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    source.fail_decodes(URL);

    let (tx, rx) = flume::unbounded();
    let tile_tx = tx.clone();
    let tile_handle = coordinator.request_tile(&entry, 0, TilePos::new(0, 0), move |result| {
        tile_tx.send(result.map(|_| ())).unwrap()
    });
    let range_handle = coordinator.request_tiles(&entry, 0, 3, |_| {});

    let result = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(result, Err(TileError::Source { .. })), "{result:?}");
    assert_eq!(tile_handle.wait_timeout(TIMEOUT), Some(JobState::Failed));
    assert_eq!(range_handle.wait_timeout(TIMEOUT), Some(JobState::Failed));

    stop(coordinator);
}

#[test]
fn test_out_of_grid_position_is_not_found() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    let result = fetch_tile(&coordinator, &entry, 0, 4, 0);
    assert!(
        matches!(result, Err(TileError::NotFound { scale: 0, x: 4, y: 0, .. })),
        "{result:?}"
    );
    // Rejected up front, nothing was decoded.
    assert_eq!(source.decode_count(URL), 1);

    stop(coordinator);
}

#[test]
fn test_unpersisted_entry_is_rejected() {
    let coordinator = spawn_coordinator(source_with_image());
    let entry = FileEntry::new(URL, 1, 1, Size::new(1000, 700), TileFormat::Png);

    let result = fetch_tile(&coordinator, &entry, 0, 0, 0);
    assert!(matches!(result, Err(TileError::InvalidImage { .. })), "{result:?}");

    stop(coordinator);
}

// =============================================================================
// Deletion and Refresh
// =============================================================================

#[test]
fn test_delete_file_entry() {
    let source = source_with_image();
    source.add_image("/images/other.png", 64, 64);
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    resolve(&coordinator, "/images/other.png").unwrap();

    let handle = coordinator.delete_file_entry(entry.id());
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));

    let (tx, rx) = flume::unbounded();
    coordinator.request_files_by_pattern("/images/*", move |r| tx.send(r).unwrap());
    let urls: Vec<String> = rx
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap()
        .iter()
        .map(|e| e.url().to_string())
        .collect();
    assert_eq!(urls, vec!["/images/other.png"]);

    // The old entry is gone and gets no new tiles.
    let result = fetch_tile(&coordinator, &entry, 7, 0, 0);
    assert!(matches!(result, Err(TileError::InvalidImage { .. })), "{result:?}");

    let again = resolve(&coordinator, URL).unwrap();
    assert_ne!(again.id(), entry.id());
    assert_eq!(source.decode_count(URL), 2);

    stop(coordinator);
}

#[test]
fn test_delete_during_generation_drops_tiles() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::at(dir.path().join("db"));
    let source = source_with_image();
    let coordinator = spawn_with_database(Database::open(&config).unwrap(), source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    source.hold();
    let (tx, rx) = flume::unbounded();
    let handle = coordinator.request_tile(&entry, 0, TilePos::new(0, 0), move |r| tx.send(r).unwrap());
    let deleted = coordinator.delete_file_entry(entry.id());
    assert_eq!(deleted.wait_timeout(TIMEOUT), Some(JobState::Finished));
    source.release();

    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Err(TileError::Aborted)));
    assert_eq!(handle.state(), JobState::Aborted);
    stop(coordinator);

    let database = Database::open(&config).unwrap();
    assert!(database.files().get_file_entry(URL).unwrap().is_none());
    assert_eq!(database.tiles().get_min_max_scale(entry.id()).unwrap(), None);
}

#[test]
fn test_refresh_provider_resolves_new_entry() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    let provider = DatabaseTileProvider::new(coordinator.clone(), entry.clone());

    let (tx, rx) = flume::unbounded();
    let handle = provider.refresh(move |r| tx.send(r).unwrap());
    let refreshed = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobState::Finished));

    assert_ne!(refreshed.entry().id(), entry.id());
    assert_eq!(refreshed.max_scale(), 7);
    assert_eq!(refreshed.image_size(), Size::new(1000, 700));
    assert_eq!(source.decode_count(URL), 2);

    drop(refreshed);
    drop(provider);
    stop(coordinator);
}

// =============================================================================
// Cancellation and Shutdown
// =============================================================================

#[test]
fn test_cancelled_request_reports_aborted() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    source.hold();
    let (tx, rx) = flume::unbounded();
    let handle = coordinator.request_tile(&entry, 0, TilePos::new(1, 1), move |r| tx.send(r).unwrap());
    assert!(handle.set_aborted());
    source.release();

    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Err(TileError::Aborted)));
    assert_eq!(handle.state(), JobState::Aborted);

    // The coordinator keeps serving after a cancellation.
    let tile = fetch_tile(&coordinator, &entry, 0, 1, 1).unwrap();
    assert_eq!(tile.surface().size(), Size::new(256, 256));

    stop(coordinator);
}

#[test]
fn test_abort_thread_answers_pending_requests() {
    let source = source_with_image();
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();

    source.hold();
    let (tx, rx) = flume::unbounded();
    coordinator.request_tile(&entry, 0, TilePos::new(0, 0), move |r| tx.send(r).unwrap());
    coordinator.abort_thread();

    let result = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(
        matches!(result, Err(TileError::Aborted) | Err(TileError::Disconnected)),
        "{result:?}"
    );
    source.release();
    coordinator.join_thread();

    let (tx, rx) = flume::unbounded();
    let handle = coordinator.request_tile(&entry, 0, TilePos::new(0, 0), move |r| tx.send(r).unwrap());
    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap(), Err(TileError::Disconnected)));
    assert_eq!(handle.state(), JobState::Aborted);
}
