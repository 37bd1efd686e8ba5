//! Source image resolution.
//!
//! The coordinator never touches the filesystem directly; it asks an
//! [`ImageSource`] for a source's identity (size and mtime) and for decoded
//! pixels. [`FsImageSource`] is the implementation the binary uses; tests
//! plug in in-memory sources.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tracing::debug;
use url::Url;

use crate::error::SourceError;
use crate::tile::{decode_image, Size, Surface, TileFormat};

/// Identity of a source at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStat {
    pub byte_size: u64,
    /// Modification time in seconds since the Unix epoch
    pub mtime: i64,
}

/// Result of decoding a source.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Decoded pixels; may be larger than requested, never smaller.
    pub surface: Surface,
    /// Full-resolution size of the source.
    pub original_size: Size,
    pub format: TileFormat,
}

/// Capability to resolve and decode source images by URL.
pub trait ImageSource: Send + Sync {
    /// Look up the size and modification time of a source.
    fn stat(&self, url: &str) -> Result<SourceStat, SourceError>;

    /// Decode a source.
    ///
    /// `downscale` is the power-of-two factor the caller will eventually
    /// need. Implementations may return any resolution between the full
    /// image and that target; the caller finishes the downscale.
    fn decode(&self, url: &str, downscale: u32) -> Result<DecodedImage, SourceError>;
}

// =============================================================================
// Filesystem Source
// =============================================================================

/// Reads sources from the local filesystem.
///
/// URLs may be plain paths or `file://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageSource;

impl FsImageSource {
    pub fn new() -> Self {
        Self
    }

    /// Map a URL to a local path.
    pub fn resolve_path(url: &str) -> Result<PathBuf, SourceError> {
        if url.contains("://") {
            let parsed = Url::parse(url).map_err(|_| SourceError::UnsupportedUrl(url.to_string()))?;
            if parsed.scheme() != "file" {
                return Err(SourceError::UnsupportedUrl(url.to_string()));
            }
            return parsed
                .to_file_path()
                .map_err(|_| SourceError::UnsupportedUrl(url.to_string()));
        }
        Ok(PathBuf::from(url))
    }
}

impl ImageSource for FsImageSource {
    fn stat(&self, url: &str) -> Result<SourceStat, SourceError> {
        let path = Self::resolve_path(url)?;
        let meta = std::fs::metadata(&path).map_err(|e| SourceError::io(url, e))?;

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(SourceStat {
            byte_size: meta.len(),
            mtime,
        })
    }

    fn decode(&self, url: &str, downscale: u32) -> Result<DecodedImage, SourceError> {
        let path = Self::resolve_path(url)?;
        let data = std::fs::read(&path).map_err(|e| SourceError::io(url, e))?;

        let (surface, format) = decode_image(&data).map_err(|source| SourceError::Codec {
            url: url.to_string(),
            source,
        })?;

        debug!(
            url = url,
            size = %surface.size(),
            downscale = downscale,
            "Decoded source image"
        );

        Ok(DecodedImage {
            original_size: surface.size(),
            surface,
            format,
        })
    }
}
