//! Tiles and the tile pyramid.
//!
//! An image is viewed as a pyramid of `TILE_SIZE` tiles. Scale 0 is the full
//! resolution; every scale above it halves both dimensions, up to the image's
//! `max_scale`, where the whole image fits in 8x8 pixels.
//!
//! # Components
//!
//! - [`Tile`], [`TileEntry`], [`TileKey`]: tile values and their stored form
//! - [`Surface`]: decoded pixels, cheap to clone
//! - [`TileEncoder`]: JPEG/PNG encoding of stored tiles
//! - [`cut_into_tiles`], [`load_surface`]: the pyramid cutter run by jobs
//! - [`ClientTileCache`]: per-image request state for a viewer thread
//! - [`TileProvider`], [`DatabaseTileProvider`]: how the cache reaches the
//!   coordinator

mod cache;
mod encoder;
mod entry;
mod generator;
mod provider;
mod surface;

pub use cache::{CacheEntry, CacheKey, ClientTileCache, TileRect, TileStatus, DEFAULT_KEEP_LEVELS};
pub use encoder::{
    clamp_quality, decode_blob, decode_image, is_valid_quality, TileEncoder, DEFAULT_JPEG_QUALITY,
    MAX_JPEG_QUALITY, MIN_JPEG_QUALITY,
};
pub use entry::{Tile, TileData, TileEntry, TileFormat, TileKey, TilePos, TILE_SIZE};
pub use generator::{cut_into_tiles, load_surface, tile_grid};
pub use provider::{DatabaseTileProvider, TileProvider};
pub use surface::{Size, Surface};
