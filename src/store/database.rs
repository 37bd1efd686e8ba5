//! File metadata plus tiles, opened together.

use tracing::{error, info};

use super::{CachedTileStore, FileDatabase, FileTileStore, RowId, SqliteTileStore, TileStore};
use crate::config::{DatabaseConfig, TileBackend, FILES_DB_NAME, TILES_DB_NAME, TILES_DIR_NAME};
use crate::error::StoreError;
use crate::tile::TileEncoder;

/// The complete persistent state: the `files` table and a tile store.
///
/// Owned by the coordinator thread. Tiles are written through a
/// [`CachedTileStore`], which is flushed when the database is dropped.
pub struct Database {
    files: FileDatabase,
    tiles: Box<dyn TileStore>,
}

impl Database {
    /// Open (creating if needed) the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the databases
    /// cannot be opened.
    pub fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::Malformed)?;

        let encoder = TileEncoder::new(config.jpeg_quality);
        let Some(dir) = config.path.as_deref() else {
            let persistent = SqliteTileStore::open_in_memory(encoder)?;
            let tiles = CachedTileStore::with_flush_threshold(Box::new(persistent), config.flush_threshold);
            return Ok(Self::from_parts(FileDatabase::open_in_memory()?, Box::new(tiles)));
        };

        std::fs::create_dir_all(dir)?;
        let files = FileDatabase::open(&dir.join(FILES_DB_NAME))?;
        let persistent: Box<dyn TileStore> = match config.backend {
            TileBackend::Sqlite => Box::new(SqliteTileStore::open(&dir.join(TILES_DB_NAME), encoder)?),
            TileBackend::Files => Box::new(FileTileStore::open(dir.join(TILES_DIR_NAME), encoder)?),
        };

        info!(
            path = %dir.display(),
            backend = ?config.backend,
            "Opened database"
        );

        let tiles = CachedTileStore::with_flush_threshold(persistent, config.flush_threshold);
        Ok(Self::from_parts(files, Box::new(tiles)))
    }

    /// An in-memory database with default settings.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(&DatabaseConfig::in_memory())
    }

    /// Assemble a database from already opened parts.
    pub fn from_parts(files: FileDatabase, tiles: Box<dyn TileStore>) -> Self {
        Self { files, tiles }
    }

    pub fn files(&self) -> &FileDatabase {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut FileDatabase {
        &mut self.files
    }

    pub fn tiles(&self) -> &dyn TileStore {
        self.tiles.as_ref()
    }

    pub fn tiles_mut(&mut self) -> &mut dyn TileStore {
        self.tiles.as_mut()
    }

    /// Remove a file entry together with all of its tiles.
    pub fn delete_file_entry(&mut self, id: RowId) -> Result<(), StoreError> {
        self.tiles.delete_tiles(id)?;
        self.files.delete_file_entry(id)
    }

    /// Flush buffered tiles and compact both databases.
    pub fn cleanup(&mut self) -> Result<(), StoreError> {
        self.tiles.cleanup()?;
        self.files.vacuum()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.tiles.flush_cache() {
            error!("Failed to flush tiles on close: {}", e);
        }
    }
}
