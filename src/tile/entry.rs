//! Tile value types.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use super::encoder::decode_blob;
use super::Surface;
use crate::error::CodecError;
use crate::store::RowId;

/// Edge length of a full tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Tile-grid position (not pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TilePos {
    pub x: u32,
    pub y: u32,
}

impl TilePos {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Position of the tile covering this one at `levels` scales coarser.
    pub fn coarser(self, levels: u32) -> Self {
        let shift = levels.min(31);
        Self::new(self.x >> shift, self.y >> shift)
    }
}

impl fmt::Display for TilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Encoding of a persisted tile or source image.
///
/// Stored as an integer: JPEG is 0, PNG is 1, unknown is -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Jpeg,
    Png,
    Unknown,
}

impl TileFormat {
    pub fn as_i64(self) -> i64 {
        match self {
            TileFormat::Jpeg => 0,
            TileFormat::Png => 1,
            TileFormat::Unknown => -1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => TileFormat::Jpeg,
            1 => TileFormat::Png,
            _ => TileFormat::Unknown,
        }
    }

    /// File extension used by the file-based tile store.
    pub fn extension(self) -> &'static str {
        match self {
            TileFormat::Jpeg => "jpg",
            TileFormat::Png => "png",
            TileFormat::Unknown => "bin",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(TileFormat::Jpeg),
            "png" => Some(TileFormat::Png),
            _ => None,
        }
    }
}

// =============================================================================
// Tile
// =============================================================================

/// One decoded tile of the pyramid.
///
/// Tile `(x, y)` at `scale` covers source pixels
/// `[x * TILE_SIZE * 2^scale, (x + 1) * TILE_SIZE * 2^scale)` on each axis.
/// Edge tiles may be smaller than `TILE_SIZE x TILE_SIZE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    scale: u32,
    pos: TilePos,
    surface: Surface,
}

impl Tile {
    pub fn new(scale: u32, pos: TilePos, surface: Surface) -> Self {
        Self { scale, pos, surface }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn pos(&self) -> TilePos {
        self.pos
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn into_surface(self) -> Surface {
        self.surface
    }
}

// =============================================================================
// Tile Entry
// =============================================================================

/// Unique identity of a stored tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub image_id: RowId,
    pub scale: u32,
    pub pos: TilePos,
}

impl TileKey {
    pub fn new(image_id: RowId, scale: u32, pos: TilePos) -> Self {
        Self { image_id, scale, pos }
    }
}

/// Pixels of a stored tile, either decoded or as persisted.
#[derive(Debug, Clone)]
pub enum TileData {
    Surface(Surface),
    Blob { data: Bytes, format: TileFormat },
}

/// Persisted form of a [`Tile`], keyed by `(image_id, scale, x, y)`.
#[derive(Debug, Clone)]
pub struct TileEntry {
    key: TileKey,
    data: TileData,
}

impl TileEntry {
    pub fn from_tile(image_id: RowId, tile: &Tile) -> Self {
        Self {
            key: TileKey::new(image_id, tile.scale, tile.pos),
            data: TileData::Surface(tile.surface.clone()),
        }
    }

    pub fn from_blob(key: TileKey, data: Bytes, format: TileFormat) -> Self {
        Self {
            key,
            data: TileData::Blob { data, format },
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn image_id(&self) -> RowId {
        self.key.image_id
    }

    pub fn scale(&self) -> u32 {
        self.key.scale
    }

    pub fn pos(&self) -> TilePos {
        self.key.pos
    }

    pub fn data(&self) -> &TileData {
        &self.data
    }

    /// Decode (if needed) into a [`Tile`].
    pub fn into_tile(self) -> Result<Tile, CodecError> {
        let surface = match self.data {
            TileData::Surface(surface) => surface,
            TileData::Blob { data, format } => decode_blob(&data, format)?,
        };
        Ok(Tile::new(self.key.scale, self.key.pos, surface))
    }
}
