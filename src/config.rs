//! Configuration management for tile-depot.
//!
//! This module provides:
//! - Command-line arguments via clap (global options plus subcommands)
//! - Environment variables with the `TILE_DEPOT_` prefix
//! - Library-level [`DatabaseConfig`] and [`CoordinatorConfig`] used when
//!   embedding the cache in another program
//!
//! # Environment Variables
//!
//! - `TILE_DEPOT_DATABASE` - Database directory (default: ./tile-depot)
//! - `TILE_DEPOT_THREADS` - Number of generation worker threads (default: 2)
//! - `TILE_DEPOT_BACKEND` - Tile storage backend, `sqlite` or `files` (default: sqlite)
//! - `TILE_DEPOT_FLUSH_THRESHOLD` - Buffered tiles before write-through (default: 256)
//! - `TILE_DEPOT_JPEG_QUALITY` - JPEG quality for stored tiles (default: 75)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::store::DEFAULT_FLUSH_THRESHOLD;
use crate::tile::{is_valid_quality, DEFAULT_JPEG_QUALITY};

// =============================================================================
// Default Values
// =============================================================================

/// Default database directory.
pub const DEFAULT_DATABASE_DIR: &str = "tile-depot";

/// Default number of generation worker threads.
pub const DEFAULT_THREADS: usize = 2;

/// Default capacity of the coordinator's receive queue.
pub const DEFAULT_RECEIVE_QUEUE: usize = 256;

/// Default capacity of the coordinator's request queue.
pub const DEFAULT_REQUEST_QUEUE: usize = 1024;

/// Default number of resolved file entries kept in memory.
pub const DEFAULT_FILE_CACHE: usize = 1024;

/// Scales generated by `prepare` without `--all`, counted from the coarsest.
pub const DEFAULT_PREPARE_SCALES: u32 = 3;

/// File name of the file metadata database inside the database directory.
pub const FILES_DB_NAME: &str = "files.sqlite3";

/// File name of the SQLite tile database inside the database directory.
pub const TILES_DB_NAME: &str = "tiles.sqlite3";

/// Directory name of the file-based tile store inside the database directory.
pub const TILES_DIR_NAME: &str = "tiles";

// =============================================================================
// Library Configuration
// =============================================================================

/// Where and how tiles are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TileBackend {
    /// BLOB rows in an SQLite table
    #[default]
    Sqlite,
    /// One image file per tile
    Files,
}

/// Settings for opening a [`Database`](crate::store::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the database files. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub backend: TileBackend,
    pub flush_threshold: usize,
    pub jpeg_quality: u8,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: TileBackend::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl DatabaseConfig {
    /// A database stored under `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// An in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.flush_threshold == 0 {
            return Err("flush_threshold must be greater than 0".to_string());
        }
        if !is_valid_quality(self.jpeg_quality) {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if self.path.is_none() && self.backend == TileBackend::Files {
            return Err("The files backend needs a database directory".to_string());
        }
        Ok(())
    }
}

/// Settings for the coordinator thread and its workers.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub threads: usize,
    pub request_queue: usize,
    pub receive_queue: usize,
    pub file_cache: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            request_queue: DEFAULT_REQUEST_QUEUE,
            receive_queue: DEFAULT_RECEIVE_QUEUE,
            file_cache: DEFAULT_FILE_CACHE,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be greater than 0".to_string());
        }
        if self.request_queue == 0 || self.receive_queue == 0 {
            return Err("queue capacities must be greater than 0".to_string());
        }
        if self.file_cache == 0 {
            return Err("file_cache must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// tile-depot - A persistent tile pyramid cache.
///
/// Cuts large images into 256x256 tiles at every zoom level, stores them in
/// SQLite or on disk, and regenerates missing tiles on background workers.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-depot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// Directory holding the tile and file databases.
    #[arg(long, short = 'd', default_value = DEFAULT_DATABASE_DIR, env = "TILE_DEPOT_DATABASE", global = true)]
    pub database: PathBuf,

    /// Number of tile generation worker threads.
    #[arg(long, short = 't', default_value_t = DEFAULT_THREADS, env = "TILE_DEPOT_THREADS", global = true)]
    pub threads: usize,

    /// Tile storage backend.
    #[arg(long, value_enum, default_value_t = TileBackend::Sqlite, env = "TILE_DEPOT_BACKEND", global = true)]
    pub backend: TileBackend,

    /// Tiles buffered in memory before they are written to the database.
    #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD, env = "TILE_DEPOT_FLUSH_THRESHOLD", global = true)]
    pub flush_threshold: usize,

    /// Capacity of the queue of generated tiles awaiting storage.
    #[arg(long, default_value_t = DEFAULT_RECEIVE_QUEUE, global = true)]
    pub receive_queue: usize,

    /// Capacity of the queue of pending requests.
    #[arg(long, default_value_t = DEFAULT_REQUEST_QUEUE, global = true)]
    pub request_queue: usize,

    /// JPEG quality (1-100) for tiles without transparency.
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "TILE_DEPOT_JPEG_QUALITY", global = true)]
    pub jpeg_quality: u8,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Resolve images and generate their tiles.
    Prepare(PrepareArgs),

    /// List stored images.
    List(ListArgs),

    /// Compact the databases.
    Cleanup,

    /// Remove images and all their tiles.
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PrepareArgs {
    /// Image paths or file:// URLs.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Generate every scale instead of only the coarsest ones.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Glob patterns matched against stored URLs; lists everything if empty.
    pub patterns: Vec<String>,

    /// Print entries as JSON lines.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Image paths or URLs, exactly as stored.
    #[arg(required = true)]
    pub urls: Vec<String>,
}

impl GlobalOptions {
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            path: Some(self.database.clone()),
            backend: self.backend,
            flush_threshold: self.flush_threshold,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            threads: self.threads,
            request_queue: self.request_queue,
            receive_queue: self.receive_queue,
            ..CoordinatorConfig::default()
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error message if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.database_config().validate()?;
        self.coordinator_config().validate()
    }
}
