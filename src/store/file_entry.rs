//! File metadata records.

use std::fmt;

use serde::Serialize;

use crate::tile::{Size, TileFormat};

/// A source stops being subdivided once its longest side fits in this many pixels.
pub const THUMBNAIL_EDGE: u32 = 8;

// =============================================================================
// Row Id
// =============================================================================

/// Persistent identifier of a row in the file table.
///
/// Zero means "not persisted yet". Store operations treat such ids as
/// not-found rather than as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct RowId(i64);

impl RowId {
    /// The id of an entry that has not been persisted.
    pub const NONE: RowId = RowId(0);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// `true` if this id refers to a persisted row.
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// File Entry
// =============================================================================

/// Metadata about one source image.
///
/// Entries are immutable. A source whose size or mtime changes gets a new
/// entry; the old entry and its tiles are deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    id: RowId,
    url: String,
    byte_size: u64,
    mtime: i64,
    width: u32,
    height: u32,
    max_scale: u32,
    format: TileFormat,
}

impl FileEntry {
    /// Create an entry that has not been persisted yet.
    pub fn new(url: impl Into<String>, byte_size: u64, mtime: i64, size: Size, format: TileFormat) -> Self {
        Self {
            id: RowId::NONE,
            url: url.into(),
            byte_size,
            mtime,
            width: size.width,
            height: size.height,
            max_scale: compute_max_scale(size),
            format,
        }
    }

    /// The same entry, tagged with the id it was persisted under.
    pub fn with_id(mut self, id: RowId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Coarsest scale of the pyramid; the image fits in one tiny tile here.
    pub fn max_scale(&self) -> u32 {
        self.max_scale
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }

    /// Image dimensions at `scale`.
    pub fn scaled_size(&self, scale: u32) -> Size {
        self.size().downscaled(scale)
    }

    /// `true` if the source still matches the recorded size and mtime.
    pub fn matches(&self, byte_size: u64, mtime: i64) -> bool {
        self.byte_size == byte_size && self.mtime == mtime
    }
}

/// Smallest scale at which the longest side is at most [`THUMBNAIL_EDGE`] pixels.
pub fn compute_max_scale(size: Size) -> u32 {
    let mut edge = size.width.max(size.height);
    let mut scale = 0;
    while edge > THUMBNAIL_EDGE {
        edge /= 2;
        scale += 1;
    }
    scale
}
