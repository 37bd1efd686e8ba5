//! Store integration tests.
//!
//! Tests verify:
//! - File entries and tiles survive closing and reopening a database
//! - Both tile backends report the same scale bounds
//! - Deleting a file entry removes its tiles
//! - Buffered tiles are visible before they are flushed

use image::{Rgb, RgbImage, Rgba, RgbaImage};
use tempfile::TempDir;

use tile_depot::store::DEFAULT_FLUSH_THRESHOLD;
use tile_depot::{
    CachedTileStore, Database, DatabaseConfig, FileEntry, FileTileStore, RowId, Size, SqliteTileStore, Surface,
    Tile, TileBackend, TileEncoder, TileFormat, TilePos, TileStore,
};

fn opaque_tile(scale: u32, x: u32, y: u32) -> Tile {
    let surface = Surface::from_rgb(RgbImage::from_pixel(32, 16, Rgb([x as u8, y as u8, 7])));
    Tile::new(scale, TilePos::new(x, y), surface)
}

fn translucent_tile(scale: u32, x: u32, y: u32) -> Tile {
    let surface = Surface::from_rgba(RgbaImage::from_pixel(16, 16, Rgba([200, 10, 10, 90])));
    Tile::new(scale, TilePos::new(x, y), surface)
}

fn config(dir: &TempDir, backend: TileBackend) -> DatabaseConfig {
    DatabaseConfig {
        backend,
        ..DatabaseConfig::at(dir.path().join("db"))
    }
}

// =============================================================================
// Persistence
// =============================================================================

fn check_reopen(backend: TileBackend) {
    let dir = TempDir::new().unwrap();
    let entry = FileEntry::new("/images/a.png", 4096, 1_700_000_000, Size::new(1000, 700), TileFormat::Png);

    let id = {
        let mut database = Database::open(&config(&dir, backend)).unwrap();
        let entry = database.files_mut().store_file_entry(&entry).unwrap();
        for scale in 0..=5 {
            database.tiles_mut().store_tile(entry.id(), &opaque_tile(scale, 0, 0)).unwrap();
        }
        database
            .tiles_mut()
            .store_tile(entry.id(), &translucent_tile(2, 1, 0))
            .unwrap();
        entry.id()
    };

    let database = Database::open(&config(&dir, backend)).unwrap();
    let stored = database.files().get_file_entry("/images/a.png").unwrap().unwrap();
    assert_eq!(stored.id(), id);
    assert_eq!(stored.size(), Size::new(1000, 700));
    assert_eq!(stored.max_scale(), 7);

    assert_eq!(database.tiles().get_min_max_scale(id).unwrap(), Some((0, 5)));
    assert!(database.tiles().has_tile(id, TilePos::new(1, 0), 2).unwrap());
    assert!(!database.tiles().has_tile(id, TilePos::new(1, 0), 3).unwrap());

    let tile = database
        .tiles()
        .get_tile(id, 2, TilePos::new(1, 0))
        .unwrap()
        .unwrap()
        .into_tile()
        .unwrap();
    assert_eq!(tile.surface().size(), Size::new(16, 16));
    assert!(tile.surface().has_alpha());

    let opaque = database
        .tiles()
        .get_tile(id, 4, TilePos::new(0, 0))
        .unwrap()
        .unwrap()
        .into_tile()
        .unwrap();
    assert_eq!(opaque.surface().size(), Size::new(32, 16));

    assert_eq!(database.tiles().get_tiles(id).unwrap().len(), 7);
}

#[test]
fn test_sqlite_backend_survives_reopen() {
    check_reopen(TileBackend::Sqlite);
}

#[test]
fn test_file_backend_survives_reopen() {
    check_reopen(TileBackend::Files);
}

#[test]
fn test_file_backend_layout() {
    let dir = TempDir::new().unwrap();
    let mut store = FileTileStore::open(dir.path().join("tiles"), TileEncoder::default()).unwrap();
    let id = RowId::new(0x1234_5678);

    store.store_tile(id, &opaque_tile(3, 2, 1)).unwrap();
    store.store_tile(id, &translucent_tile(3, 0, 0)).unwrap();

    let image_dir = dir.path().join("tiles").join("012").join("345").join("678");
    assert_eq!(store.image_directory(id), image_dir);
    assert!(image_dir.join("tile-3-2-1.jpg").is_file());
    assert!(image_dir.join("tile-3-0-0.png").is_file());

    store.delete_tiles(id).unwrap();
    assert!(!image_dir.join("tile-3-2-1.jpg").exists());
    assert_eq!(store.get_min_max_scale(id).unwrap(), None);
}

// =============================================================================
// File Entries
// =============================================================================

#[test]
fn test_store_file_entry_upserts_by_url() {
    let mut database = Database::in_memory().unwrap();
    let first = FileEntry::new("/a.png", 10, 1, Size::new(64, 64), TileFormat::Png);
    let first = database.files_mut().store_file_entry(&first).unwrap();

    let changed = FileEntry::new("/a.png", 20, 2, Size::new(128, 64), TileFormat::Jpeg);
    let changed = database.files_mut().store_file_entry(&changed).unwrap();

    let entries = database.files().get_file_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].byte_size(), 20);
    assert_eq!(entries[0].size(), Size::new(128, 64));
    assert_eq!(entries[0].id(), changed.id());
    assert!(first.id().is_valid());
}

#[test]
fn test_ids_are_not_reused_after_delete() {
    let dir = TempDir::new().unwrap();
    let mut database = Database::open(&config(&dir, TileBackend::Sqlite)).unwrap();

    let a = FileEntry::new("/a.png", 1, 1, Size::new(8, 8), TileFormat::Png);
    let a = database.files_mut().store_file_entry(&a).unwrap();
    database.delete_file_entry(a.id()).unwrap();

    let b = FileEntry::new("/b.png", 1, 1, Size::new(8, 8), TileFormat::Png);
    let b = database.files_mut().store_file_entry(&b).unwrap();
    assert!(b.id().get() > a.id().get());
}

#[test]
fn test_entries_by_pattern() {
    let mut database = Database::in_memory().unwrap();
    for url in ["/photos/a.jpg", "/photos/b.png", "/scans/c.jpg"] {
        let entry = FileEntry::new(url, 1, 1, Size::new(8, 8), TileFormat::Jpeg);
        database.files_mut().store_file_entry(&entry).unwrap();
    }

    let jpegs: Vec<_> = database
        .files()
        .get_file_entries_by_pattern("*.jpg")
        .unwrap()
        .into_iter()
        .map(|e| e.url().to_string())
        .collect();
    assert_eq!(jpegs, vec!["/photos/a.jpg", "/scans/c.jpg"]);

    let photos = database.files().get_file_entries_by_pattern("/photos/*").unwrap();
    assert_eq!(photos.len(), 2);
}

#[test]
fn test_delete_file_entry_removes_tiles() {
    let dir = TempDir::new().unwrap();
    let mut database = Database::open(&config(&dir, TileBackend::Sqlite)).unwrap();
    let entry = FileEntry::new("/gone.png", 1, 1, Size::new(300, 200), TileFormat::Png);
    let entry = database.files_mut().store_file_entry(&entry).unwrap();
    database.tiles_mut().store_tile(entry.id(), &opaque_tile(0, 0, 0)).unwrap();
    database.tiles_mut().flush_cache().unwrap();

    database.delete_file_entry(entry.id()).unwrap();

    assert!(database.files().get_file_entry("/gone.png").unwrap().is_none());
    assert!(database.files().get_file_entry_by_id(entry.id()).unwrap().is_none());
    assert_eq!(database.tiles().get_min_max_scale(entry.id()).unwrap(), None);
    database.cleanup().unwrap();
}

// =============================================================================
// Write-back Cache
// =============================================================================

#[test]
fn test_cached_store_reads_through_buffer() {
    let dir = TempDir::new().unwrap();
    let persistent = SqliteTileStore::open(&dir.path().join("tiles.sqlite3"), TileEncoder::default()).unwrap();
    let mut store = CachedTileStore::with_flush_threshold(Box::new(persistent), DEFAULT_FLUSH_THRESHOLD);
    let id = RowId::new(3);

    store.store_tile(id, &opaque_tile(1, 0, 0)).unwrap();
    store.store_tile(id, &opaque_tile(4, 0, 0)).unwrap();
    assert_eq!(store.buffered(), 2);
    assert_eq!(store.get_min_max_scale(id).unwrap(), Some((1, 4)));
    assert!(store.has_tile(id, TilePos::new(0, 0), 4).unwrap());

    store.flush_cache().unwrap();
    assert_eq!(store.buffered(), 0);
    assert_eq!(store.get_min_max_scale(id).unwrap(), Some((1, 4)));

    store.store_tile(id, &opaque_tile(0, 0, 0)).unwrap();
    assert_eq!(store.get_min_max_scale(id).unwrap(), Some((0, 4)));
    assert_eq!(store.get_tiles(id).unwrap().len(), 3);
}
