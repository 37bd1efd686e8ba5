//! Where a [`ClientTileCache`](super::ClientTileCache) gets its tiles.

use crate::coordinator::{DatabaseCoordinator, TileCallback};
use crate::error::TileError;
use crate::job::JobHandle;
use crate::store::FileEntry;

use super::{Size, TilePos, TILE_SIZE};

/// Asynchronous tile source for one image.
pub trait TileProvider {
    /// Start fetching a tile. `callback` may run on any thread.
    fn request_tile(&self, scale: u32, pos: TilePos, callback: TileCallback) -> JobHandle;

    /// Coarsest scale of the image's pyramid.
    fn max_scale(&self) -> u32;

    fn tile_size(&self) -> u32 {
        TILE_SIZE
    }

    /// Full-resolution size of the image.
    fn image_size(&self) -> Size;
}

/// A [`TileProvider`] backed by the database coordinator.
#[derive(Clone)]
pub struct DatabaseTileProvider {
    coordinator: DatabaseCoordinator,
    entry: FileEntry,
}

impl DatabaseTileProvider {
    pub fn new(coordinator: DatabaseCoordinator, entry: FileEntry) -> Self {
        Self { coordinator, entry }
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    /// Drop everything stored for the image and resolve its URL again.
    ///
    /// `callback` receives a provider for the new entry.
    pub fn refresh<F>(&self, callback: F) -> JobHandle
    where
        F: FnOnce(Result<DatabaseTileProvider, TileError>) + Send + 'static,
    {
        // Requests are handled in order, so the lookup below misses.
        self.coordinator.delete_file_entry(self.entry.id());

        let coordinator = self.coordinator.clone();
        self.coordinator.request_file(
            self.entry.url(),
            move |result| callback(result.map(|entry| DatabaseTileProvider::new(coordinator, entry))),
            |_| {},
        )
    }
}

impl TileProvider for DatabaseTileProvider {
    fn request_tile(&self, scale: u32, pos: TilePos, callback: TileCallback) -> JobHandle {
        self.coordinator.request_tile(&self.entry, scale, pos, callback)
    }

    fn max_scale(&self) -> u32 {
        self.entry.max_scale()
    }

    fn image_size(&self) -> Size {
        self.entry.size()
    }
}
