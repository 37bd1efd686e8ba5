//! Persistent storage for file metadata and tiles.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                    Database                    │
//! │  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ FileDatabase │  │    CachedTileStore     │  │
//! │  │   (files     │  │  ┌────────┐ ┌────────┐ │  │
//! │  │    table)    │  │  │ Memory │→│ SQLite │ │  │
//! │  └──────────────┘  │  │        │ │ / file │ │  │
//! │                    │  └────────┘ └────────┘ │  │
//! │                    └────────────────────────┘  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! All tile stores implement [`TileStore`]. Stores are owned and used by a
//! single thread (the coordinator), so none of them lock internally.
//!
//! Every operation taking an image id treats a non-persisted id
//! ([`RowId::NONE`]) as "nothing stored": lookups report not-found and
//! writes are skipped.

mod cached;
mod database;
mod file;
mod file_entry;
mod files;
mod memory;
mod sqlite;

pub use cached::{CachedTileStore, DEFAULT_FLUSH_THRESHOLD};
pub use database::Database;
pub use file::FileTileStore;
pub use file_entry::{compute_max_scale, FileEntry, RowId, THUMBNAIL_EDGE};
pub use files::FileDatabase;
pub use memory::MemoryTileStore;
pub use sqlite::SqliteTileStore;

use bytes::Bytes;

use crate::error::{CodecError, StoreError};
use crate::tile::{Tile, TileData, TileEncoder, TileEntry, TileFormat, TilePos};

/// Storage backend for tiles.
pub trait TileStore: Send {
    /// `true` if the tile is stored.
    fn has_tile(&self, image_id: RowId, pos: TilePos, scale: u32) -> Result<bool, StoreError>;

    /// Look up a single tile.
    fn get_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError>;

    /// Every tile stored for an image.
    fn get_tiles(&self, image_id: RowId) -> Result<Vec<TileEntry>, StoreError>;

    /// Smallest and largest scale with stored tiles, if any.
    fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<(u32, u32)>, StoreError>;

    /// Store one tile, replacing any tile with the same key.
    fn store_tile(&mut self, image_id: RowId, tile: &Tile) -> Result<(), StoreError> {
        self.store_tiles(&[TileEntry::from_tile(image_id, tile)])
    }

    /// Store many tiles, replacing any tiles with the same keys.
    fn store_tiles(&mut self, tiles: &[TileEntry]) -> Result<(), StoreError>;

    /// Remove every tile of an image.
    fn delete_tiles(&mut self, image_id: RowId) -> Result<(), StoreError>;

    /// Write buffered tiles through to durable storage.
    fn flush_cache(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Reclaim space left behind by deleted tiles.
    fn cleanup(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Encoded form of a tile entry, ready to be written.
pub(crate) fn encode_entry(encoder: &TileEncoder, entry: &TileEntry) -> Result<(Bytes, TileFormat), CodecError> {
    match entry.data() {
        TileData::Surface(surface) => encoder.encode(surface),
        TileData::Blob { data, format } => Ok((data.clone(), *format)),
    }
}

/// Merge two optional scale ranges into the range covering both.
pub(crate) fn merge_bounds(a: Option<(u32, u32)>, b: Option<(u32, u32)>) -> Option<(u32, u32)> {
    match (a, b) {
        (Some((a_min, a_max)), Some((b_min, b_max))) => Some((a_min.min(b_min), a_max.max(b_max))),
        (Some(bounds), None) | (None, Some(bounds)) => Some(bounds),
        (None, None) => None,
    }
}
