//! In-memory tile store.

use super::{RowId, TileStore};
use crate::error::StoreError;
use crate::tile::{TileEntry, TilePos};

/// Tiles held in a plain vector.
///
/// Used as the write-back buffer of [`CachedTileStore`](super::CachedTileStore);
/// it never evicts on its own, so its owner must flush it regularly.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: Vec<TileEntry>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered tiles.
    pub fn size(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Remove and return every buffered tile.
    pub fn take_all(&mut self) -> Vec<TileEntry> {
        std::mem::take(&mut self.tiles)
    }

    fn find(&self, image_id: RowId, scale: u32, pos: TilePos) -> Option<&TileEntry> {
        self.tiles
            .iter()
            .find(|t| t.image_id() == image_id && t.scale() == scale && t.pos() == pos)
    }
}

impl TileStore for MemoryTileStore {
    fn has_tile(&self, image_id: RowId, pos: TilePos, scale: u32) -> Result<bool, StoreError> {
        Ok(image_id.is_valid() && self.find(image_id, scale, pos).is_some())
    }

    fn get_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }
        Ok(self.find(image_id, scale, pos).cloned())
    }

    fn get_tiles(&self, image_id: RowId) -> Result<Vec<TileEntry>, StoreError> {
        Ok(self
            .tiles
            .iter()
            .filter(|t| image_id.is_valid() && t.image_id() == image_id)
            .cloned()
            .collect())
    }

    fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<(u32, u32)>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }

        let bounds = self
            .tiles
            .iter()
            .filter(|t| t.image_id() == image_id)
            .fold(None, |acc: Option<(u32, u32)>, t| match acc {
                None => Some((t.scale(), t.scale())),
                Some((lo, hi)) => Some((lo.min(t.scale()), hi.max(t.scale()))),
            });
        Ok(bounds)
    }

    fn store_tiles(&mut self, tiles: &[TileEntry]) -> Result<(), StoreError> {
        for tile in tiles.iter().filter(|t| t.image_id().is_valid()) {
            match self.tiles.iter_mut().find(|t| t.key() == tile.key()) {
                Some(existing) => *existing = tile.clone(),
                None => self.tiles.push(tile.clone()),
            }
        }
        Ok(())
    }

    fn delete_tiles(&mut self, image_id: RowId) -> Result<(), StoreError> {
        self.tiles.retain(|t| t.image_id() != image_id);
        Ok(())
    }
}
