//! # tile-depot
//!
//! A persistent tile pyramid cache for image viewers.
//!
//! Large images are cut into 256x256 tiles at every zoom level. Generated
//! tiles are stored in SQLite (or as files on disk) so that repeat views are
//! instant, and missing tiles are generated on background workers without
//! blocking the viewer.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tile`] - Tile values, the pyramid cutter and the client-side cache
//! - [`job`] - Cancellable jobs and the worker pool
//! - [`store`] - Tile stores and the file metadata table
//! - [`coordinator`] - The thread that owns the database and schedules generation
//! - [`source`] - Resolving and decoding source images
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_depot::{Database, DatabaseConfig, CoordinatorConfig, DatabaseCoordinator, FsImageSource};
//! use tile_depot::tile::{ClientTileCache, DatabaseTileProvider};
//!
//! let database = Database::open(&DatabaseConfig::at("tile-depot")).unwrap();
//! let coordinator = DatabaseCoordinator::spawn(
//!     database,
//!     Arc::new(FsImageSource::new()),
//!     &CoordinatorConfig::default(),
//! )
//! .unwrap();
//!
//! let (tx, rx) = flume::bounded(1);
//! coordinator.request_file("/photos/large.jpg", move |entry| { let _ = tx.send(entry); }, |_| {});
//! let entry = rx.recv().unwrap().unwrap();
//!
//! let mut cache = ClientTileCache::new(DatabaseTileProvider::new(coordinator, entry));
//! cache.request_tile(0, 0, 0);
//! // ... once per frame:
//! cache.process_queue();
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod source;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use config::{CoordinatorConfig, DatabaseConfig, TileBackend};
pub use coordinator::DatabaseCoordinator;
pub use error::{CodecError, JobError, SourceError, StoreError, TileError};
pub use job::{Job, JobHandle, JobHandleGroup, JobManager, JobState};
pub use source::{DecodedImage, FsImageSource, ImageSource, SourceStat};
pub use store::{
    CachedTileStore, Database, FileDatabase, FileEntry, FileTileStore, MemoryTileStore, RowId,
    SqliteTileStore, TileStore,
};
pub use tile::{
    ClientTileCache, DatabaseTileProvider, Size, Surface, Tile, TileEncoder, TileEntry, TileFormat,
    TilePos, TileProvider, TILE_SIZE,
};
