//! Write-back tile store.

use std::collections::BTreeMap;

use tracing::{debug, error};

use super::{merge_bounds, MemoryTileStore, RowId, TileStore};
use crate::error::StoreError;
use crate::tile::{TileEntry, TilePos};

/// Buffered tiles are written through once the buffer holds more than this many.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 256;

/// A memory buffer in front of a durable store.
///
/// Writes land in memory and reach the durable store in batches: when the
/// buffer grows past the flush threshold, on [`flush_cache`](TileStore::flush_cache),
/// and when the store is dropped. Reads consult memory first.
pub struct CachedTileStore {
    memory: MemoryTileStore,
    persistent: Box<dyn TileStore>,
    flush_threshold: usize,
}

impl CachedTileStore {
    pub fn new(persistent: Box<dyn TileStore>) -> Self {
        Self::with_flush_threshold(persistent, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_flush_threshold(persistent: Box<dyn TileStore>, flush_threshold: usize) -> Self {
        Self {
            memory: MemoryTileStore::new(),
            persistent,
            flush_threshold,
        }
    }

    /// Number of tiles waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.memory.size()
    }

    fn flush_if_full(&mut self) -> Result<(), StoreError> {
        if self.memory.size() > self.flush_threshold {
            self.flush_cache()?;
        }
        Ok(())
    }
}

impl TileStore for CachedTileStore {
    fn has_tile(&self, image_id: RowId, pos: TilePos, scale: u32) -> Result<bool, StoreError> {
        Ok(self.memory.has_tile(image_id, pos, scale)? || self.persistent.has_tile(image_id, pos, scale)?)
    }

    fn get_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError> {
        match self.memory.get_tile(image_id, scale, pos)? {
            Some(tile) => Ok(Some(tile)),
            None => self.persistent.get_tile(image_id, scale, pos),
        }
    }

    fn get_tiles(&self, image_id: RowId) -> Result<Vec<TileEntry>, StoreError> {
        let mut tiles: BTreeMap<_, TileEntry> = self
            .persistent
            .get_tiles(image_id)?
            .into_iter()
            .map(|t| (t.key(), t))
            .collect();

        // Buffered tiles are newer than their persisted versions.
        for tile in self.memory.get_tiles(image_id)? {
            tiles.insert(tile.key(), tile);
        }
        Ok(tiles.into_values().collect())
    }

    fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<(u32, u32)>, StoreError> {
        Ok(merge_bounds(
            self.memory.get_min_max_scale(image_id)?,
            self.persistent.get_min_max_scale(image_id)?,
        ))
    }

    fn store_tiles(&mut self, tiles: &[TileEntry]) -> Result<(), StoreError> {
        self.memory.store_tiles(tiles)?;
        self.flush_if_full()
    }

    fn delete_tiles(&mut self, image_id: RowId) -> Result<(), StoreError> {
        self.memory.delete_tiles(image_id)?;
        self.persistent.delete_tiles(image_id)
    }

    fn flush_cache(&mut self) -> Result<(), StoreError> {
        if self.memory.is_empty() {
            return Ok(());
        }

        let tiles = self.memory.take_all();
        debug!(count = tiles.len(), "Flushing tile cache");

        if let Err(e) = self.persistent.store_tiles(&tiles) {
            // Keep the tiles so a later flush can retry.
            self.memory.store_tiles(&tiles)?;
            return Err(e);
        }
        self.persistent.flush_cache()
    }

    fn cleanup(&mut self) -> Result<(), StoreError> {
        self.flush_cache()?;
        self.persistent.cleanup()
    }
}

impl Drop for CachedTileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush_cache() {
            error!("Failed to flush tile cache on shutdown: {}", e);
        }
    }
}
