//! Client tile cache integration tests.
//!
//! Tests verify:
//! - Tiles requested through the cache arrive from a live coordinator
//! - Coarser placeholders are found while fine tiles are pending
//! - Cancelled requests never become resident, even if their tiles arrive
//! - Cleanup keeps only coarse tiles

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tile_depot::tile::{ClientTileCache, TileRect, TileStatus};
use tile_depot::{DatabaseCoordinator, DatabaseTileProvider, JobState, Size, TileProvider};

use super::test_utils::{resolve, spawn_coordinator, stop, TestSource, TIMEOUT};

const URL: &str = "/images/map.png";

fn setup() -> (Arc<TestSource>, DatabaseCoordinator, ClientTileCache<DatabaseTileProvider>) {
    let source = TestSource::new();
    source.add_image(URL, 1000, 700);
    let coordinator = spawn_coordinator(source.clone());
    let entry = resolve(&coordinator, URL).unwrap();
    let cache = ClientTileCache::new(DatabaseTileProvider::new(coordinator.clone(), entry));
    (source, coordinator, cache)
}

/// Process completions until `done` holds.
fn pump<F>(cache: &mut ClientTileCache<DatabaseTileProvider>, mut done: F)
where
    F: FnMut(&mut ClientTileCache<DatabaseTileProvider>) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        cache.process_queue();
        if done(cache) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for tiles");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_visible_tiles_become_resident() {
    let (_source, coordinator, mut cache) = setup();
    assert_eq!(cache.max_scale(), 7);

    for y in 0..3 {
        for x in 0..4 {
            assert_eq!(cache.request_tile(x, y, 0).status(), TileStatus::Requested);
        }
    }
    assert_eq!(cache.len(), 12);

    pump(&mut cache, |cache| {
        (0..3).all(|y| (0..4).all(|x| cache.get_tile(x, y, 0).is_some()))
    });

    assert_eq!(cache.get_tile(0, 0, 0).unwrap().size(), Size::new(256, 256));
    assert_eq!(cache.get_tile(3, 2, 0).unwrap().size(), Size::new(232, 188));

    // A second request for a resident tile is answered from the cache.
    assert_eq!(cache.request_tile(3, 2, 0).status(), TileStatus::Succeeded);
    assert_eq!(cache.len(), 12);

    drop(cache);
    stop(coordinator);
}

#[test]
fn test_coarse_placeholder_while_fine_tile_pending() {
    let (source, coordinator, mut cache) = setup();

    cache.request_tile(0, 0, 7);
    pump(&mut cache, |cache| cache.get_tile(0, 0, 7).is_some());

    source.hold();
    cache.request_tile(3, 2, 0);
    cache.process_queue();
    assert!(cache.get_tile(3, 2, 0).is_none());

    let (placeholder, levels) = cache.find_smaller_tile(3, 2, 0).unwrap();
    assert_eq!(levels, 7);
    assert_eq!(placeholder.size(), Size::new(7, 5));

    // Nothing coarser than the coarsest scale.
    assert!(cache.find_smaller_tile(0, 0, 7).is_none());

    source.release();
    pump(&mut cache, |cache| cache.get_tile(3, 2, 0).is_some());

    drop(cache);
    stop(coordinator);
}

#[test]
fn test_cancelled_tiles_never_become_resident() {
    let (source, coordinator, mut cache) = setup();

    source.hold();
    let mut handles = Vec::new();
    for x in 0..4 {
        handles.push(cache.request_tile(x, 0, 0).handle().clone());
    }

    // Only the first column stays on screen.
    cache.cancel_jobs(TileRect::new(0, 0, 1, 1), 0);
    assert_eq!(cache.len(), 1);
    for handle in &handles[1..] {
        assert_eq!(handle.state(), JobState::Aborted);
    }

    source.release();
    pump(&mut cache, |cache| cache.get_tile(0, 0, 0).is_some());

    // Let any late answers for the cancelled tiles arrive and be dropped.
    for handle in &handles {
        handle.wait_timeout(TIMEOUT).unwrap();
    }
    cache.process_queue();
    assert_eq!(cache.len(), 1);
    for x in 1..4 {
        assert!(cache.get_tile(x, 0, 0).is_none());
    }

    drop(cache);
    stop(coordinator);
}

#[test]
fn test_failed_tile_is_marked_failed() {
    let (source, coordinator, mut cache) = setup();
    source.fail_decodes(URL);

    cache.request_tile(1, 1, 0);
    pump(&mut cache, |cache| {
        cache.request_tile(1, 1, 0).status() == TileStatus::Failed
    });
    assert!(cache.get_tile(1, 1, 0).is_none());

    // Cleanup forgets failures so they can be retried later.
    cache.cleanup();
    assert!(cache.is_empty());

    drop(cache);
    stop(coordinator);
}

#[test]
fn test_cleanup_keeps_coarse_tiles() {
    let (_source, coordinator, mut cache) = setup();
    let max_scale = cache.provider().max_scale();

    for scale in [0, max_scale - 1, max_scale] {
        cache.request_tile(0, 0, scale);
    }
    pump(&mut cache, |cache| {
        [0, max_scale - 1, max_scale]
            .iter()
            .all(|scale| cache.get_tile(0, 0, *scale).is_some())
    });

    cache.cleanup();
    assert_eq!(cache.len(), 2);
    assert!(cache.get_tile(0, 0, 0).is_none());
    assert!(cache.get_tile(0, 0, max_scale).is_some());

    cache.clear();
    assert!(cache.is_empty());

    drop(cache);
    stop(coordinator);
}
