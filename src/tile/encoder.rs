//! Tile codec.
//!
//! Tiles without alpha are persisted as JPEG, tiles with alpha as PNG. The
//! format tag travels with the blob so decoding never has to guess, except
//! for legacy rows tagged `UNKNOWN`, which are sniffed by magic bytes.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;

use super::{Surface, TileFormat};
use crate::error::CodecError;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

// =============================================================================
// Tile Encoder
// =============================================================================

/// Encodes surfaces for persistence.
#[derive(Debug, Clone, Copy)]
pub struct TileEncoder {
    jpeg_quality: u8,
}

impl Default for TileEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl TileEncoder {
    /// Create an encoder; `jpeg_quality` is clamped to 1-100.
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: clamp_quality(jpeg_quality),
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Encode a surface, picking the format from its pixel layout.
    ///
    /// # Returns
    ///
    /// The encoded bytes and the format tag to persist alongside them.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the underlying encoder fails.
    pub fn encode(&self, surface: &Surface) -> Result<(Bytes, TileFormat), CodecError> {
        let mut output = Vec::new();

        if surface.has_alpha() {
            surface
                .image()
                .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
                .map_err(|e| CodecError::Encode {
                    message: e.to_string(),
                })?;
            return Ok((Bytes::from(output), TileFormat::Png));
        }

        let encoder = JpegEncoder::new_with_quality(&mut output, self.jpeg_quality);
        surface
            .image()
            .write_with_encoder(encoder)
            .map_err(|e| CodecError::Encode {
                message: e.to_string(),
            })?;

        Ok((Bytes::from(output), TileFormat::Jpeg))
    }

    /// Decode a persisted blob.
    pub fn decode(&self, data: &[u8], format: TileFormat) -> Result<Surface, CodecError> {
        decode_blob(data, format)
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a persisted tile blob using its format tag.
pub fn decode_blob(data: &[u8], format: TileFormat) -> Result<Surface, CodecError> {
    let reader = match format {
        TileFormat::Jpeg => ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg),
        TileFormat::Png => ImageReader::with_format(Cursor::new(data), ImageFormat::Png),
        TileFormat::Unknown => guessing_reader(data)?,
    };

    let img = reader.decode().map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })?;

    Ok(Surface::new(img))
}

/// Decode arbitrary image bytes, detecting the format from its content.
///
/// # Returns
///
/// The decoded surface and the detected encoding.
pub fn decode_image(data: &[u8]) -> Result<(Surface, TileFormat), CodecError> {
    let reader = guessing_reader(data)?;
    let format = match reader.format() {
        Some(ImageFormat::Jpeg) => TileFormat::Jpeg,
        Some(ImageFormat::Png) => TileFormat::Png,
        _ => TileFormat::Unknown,
    };

    let img = reader.decode().map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })?;

    Ok((Surface::new(img), format))
}

fn guessing_reader(data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, CodecError> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode {
            message: e.to_string(),
        })
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Validate JPEG quality parameter.
///
/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

/// Clamp quality to valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
