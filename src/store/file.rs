//! Tile store keeping one file per tile.
//!
//! Layout: `<prefix>/<hex3>/<hex3>/<hex3>/tile-<scale>-<x>-<y>.<jpg|png>`.
//! The three hex groups are bits 24-35, 12-23 and 0-11 of the image id, which
//! keeps every directory below 4096 entries.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{encode_entry, RowId, TileStore};
use crate::error::StoreError;
use crate::tile::{TileEncoder, TileEntry, TileFormat, TileKey, TilePos};

const EXTENSIONS: [TileFormat; 2] = [TileFormat::Jpeg, TileFormat::Png];

/// Tiles stored as individual image files under a root directory.
pub struct FileTileStore {
    prefix: PathBuf,
    encoder: TileEncoder,
}

/// Name of one tile file, parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileFileName {
    scale: u32,
    pos: TilePos,
    format: TileFormat,
}

impl FileTileStore {
    /// Open the store rooted at `prefix`, creating the directory if needed.
    pub fn open(prefix: impl Into<PathBuf>, encoder: TileEncoder) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        fs::create_dir_all(&prefix)?;
        debug!(prefix = %prefix.display(), "Opened file tile store");
        Ok(Self { prefix, encoder })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Directory holding every tile of an image.
    pub fn image_directory(&self, image_id: RowId) -> PathBuf {
        let id = image_id.get();
        self.prefix
            .join(format!("{:03x}", (id >> 24) & 0xfff))
            .join(format!("{:03x}", (id >> 12) & 0xfff))
            .join(format!("{:03x}", id & 0xfff))
    }

    fn tile_path(&self, image_id: RowId, scale: u32, pos: TilePos, format: TileFormat) -> PathBuf {
        self.image_directory(image_id)
            .join(format!("tile-{}-{}-{}.{}", scale, pos.x, pos.y, format.extension()))
    }

    /// Parsed names of every tile file of an image; unknown files are skipped.
    fn scan(&self, image_id: RowId) -> Result<Vec<TileFileName>, StoreError> {
        let directory = self.image_directory(image_id);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_filename) {
                Some(parsed) => names.push(parsed),
                None => warn!(
                    path = %entry.path().display(),
                    "Unknown file in tile directory, skipping"
                ),
            }
        }
        Ok(names)
    }

    fn read_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError> {
        for format in EXTENSIONS {
            let path = self.tile_path(image_id, scale, pos, format);
            match fs::read(&path) {
                Ok(data) => {
                    let key = TileKey::new(image_id, scale, pos);
                    return Ok(Some(TileEntry::from_blob(key, Bytes::from(data), format)));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn write_tile(&self, entry: &TileEntry) -> Result<(), StoreError> {
        let (data, format) = encode_entry(&self.encoder, entry)?;
        let format = match format {
            TileFormat::Unknown => sniff_format(&data),
            known => known,
        };

        let key = entry.key();
        fs::create_dir_all(self.image_directory(key.image_id))?;

        let path = self.tile_path(key.image_id, key.scale, key.pos, format);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;

        // A tile re-encoded in the other format must not leave its old file behind.
        for other in EXTENSIONS.into_iter().filter(|f| *f != format) {
            remove_if_exists(&self.tile_path(key.image_id, key.scale, key.pos, other))?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sniff_format(data: &[u8]) -> TileFormat {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        TileFormat::Png
    } else {
        TileFormat::Jpeg
    }
}

/// Parse `tile-<scale>-<x>-<y>.<ext>`.
fn parse_filename(name: &str) -> Option<TileFileName> {
    let (stem, ext) = name.rsplit_once('.')?;
    let format = TileFormat::from_extension(ext)?;

    let mut parts = stem.strip_prefix("tile-")?.split('-');
    let scale = parts.next()?.parse().ok()?;
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(TileFileName {
        scale,
        pos: TilePos::new(x, y),
        format,
    })
}

impl TileStore for FileTileStore {
    fn has_tile(&self, image_id: RowId, pos: TilePos, scale: u32) -> Result<bool, StoreError> {
        if !image_id.is_valid() {
            return Ok(false);
        }
        Ok(EXTENSIONS
            .iter()
            .any(|format| self.tile_path(image_id, scale, pos, *format).exists()))
    }

    fn get_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<TileEntry>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }
        self.read_tile(image_id, scale, pos)
    }

    fn get_tiles(&self, image_id: RowId) -> Result<Vec<TileEntry>, StoreError> {
        if !image_id.is_valid() {
            return Ok(Vec::new());
        }

        let mut names = self.scan(image_id)?;
        names.sort_by_key(|n| (n.scale, n.pos.y, n.pos.x));

        let mut tiles = Vec::with_capacity(names.len());
        for name in names {
            let path = self.tile_path(image_id, name.scale, name.pos, name.format);
            let data = fs::read(&path)?;
            let key = TileKey::new(image_id, name.scale, name.pos);
            tiles.push(TileEntry::from_blob(key, Bytes::from(data), name.format));
        }
        Ok(tiles)
    }

    fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<(u32, u32)>, StoreError> {
        if !image_id.is_valid() {
            return Ok(None);
        }
        let names = self.scan(image_id)?;
        let min = names.iter().map(|n| n.scale).min();
        let max = names.iter().map(|n| n.scale).max();
        Ok(min.zip(max))
    }

    fn store_tiles(&mut self, tiles: &[TileEntry]) -> Result<(), StoreError> {
        for entry in tiles.iter().filter(|t| t.image_id().is_valid()) {
            self.write_tile(entry)?;
        }
        Ok(())
    }

    fn delete_tiles(&mut self, image_id: RowId) -> Result<(), StoreError> {
        if !image_id.is_valid() {
            return Ok(());
        }
        match fs::remove_dir_all(self.image_directory(image_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
