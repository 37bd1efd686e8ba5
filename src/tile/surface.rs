//! Decoded pixel surfaces.
//!
//! A [`Surface`] is an immutable, cheaply clonable RGB8 or RGBA8 image. It is
//! the pixel payload of every [`Tile`](super::Tile) and the unit the pyramid
//! cutter works on: halving for the next scale, cropping tiles out of a
//! scale, and rescaling a decoded source to its exact target size.

use std::fmt;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Pixel, RgbImage, RgbaImage};

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions after downscaling by `2^scale`, never smaller than 1x1.
    pub fn downscaled(self, scale: u32) -> Self {
        let shift = scale.min(31);
        Self {
            width: (self.width >> shift).max(1),
            height: (self.height >> shift).max(1),
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Shared, immutable pixel buffer.
///
/// Surfaces are always stored as RGB8 (no alpha) or RGBA8 (alpha); anything
/// else is converted on construction.
#[derive(Clone)]
pub struct Surface {
    image: Arc<DynamicImage>,
}

impl Surface {
    /// Wrap a decoded image, normalizing its pixel layout.
    pub fn new(image: DynamicImage) -> Self {
        let image = match image {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image,
            other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };
        Self {
            image: Arc::new(image),
        }
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        Self::new(DynamicImage::ImageRgb8(image))
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        Self::new(DynamicImage::ImageRgba8(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    pub fn has_alpha(&self) -> bool {
        self.image.color().has_alpha()
    }

    /// Borrow the underlying image.
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Raw pixel bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_bytes()
    }

    /// Halve both dimensions with a 2x2 box filter.
    ///
    /// Odd trailing rows/columns are folded into the last output pixel by
    /// clamping the sample coordinates. The result is never smaller than 1x1.
    pub fn halve(&self) -> Surface {
        match self.image.as_ref() {
            DynamicImage::ImageRgba8(buf) => Surface::from_rgba(halve_buffer(buf)),
            DynamicImage::ImageRgb8(buf) => Surface::from_rgb(halve_buffer(buf)),
            other => Surface::from_rgb(halve_buffer(&other.to_rgb8())),
        }
    }

    /// Crop a region, clamped to the surface bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Surface {
        let x = x.min(self.width());
        let y = y.min(self.height());
        let width = width.min(self.width() - x);
        let height = height.min(self.height() - y);
        Surface::new(self.image.crop_imm(x, y, width, height))
    }

    /// Resize to exactly `size`.
    pub fn scale(&self, size: Size) -> Surface {
        if size == self.size() {
            return self.clone();
        }
        Surface::new(
            self.image
                .resize_exact(size.width.max(1), size.height.max(1), FilterType::Triangle),
        )
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
            || (self.size() == other.size()
                && self.has_alpha() == other.has_alpha()
                && self.as_bytes() == other.as_bytes())
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("size", &self.size())
            .field("alpha", &self.has_alpha())
            .finish()
    }
}

fn halve_buffer<P>(src: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 {
        return ImageBuffer::new(1, 1);
    }

    let out_width = (width / 2).max(1);
    let out_height = (height / 2).max(1);

    ImageBuffer::from_fn(out_width, out_height, |x, y| {
        let x0 = (2 * x).min(width - 1);
        let x1 = (2 * x + 1).min(width - 1);
        let y0 = (2 * y).min(height - 1);
        let y1 = (2 * y + 1).min(height - 1);

        let samples = [
            src.get_pixel(x0, y0),
            src.get_pixel(x1, y0),
            src.get_pixel(x0, y1),
            src.get_pixel(x1, y1),
        ];

        let mut out = *samples[0];
        for (c, channel) in out.channels_mut().iter_mut().enumerate() {
            let sum: u32 = samples.iter().map(|p| u32::from(p.channels()[c])).sum();
            *channel = ((sum + 2) / 4) as u8;
        }
        out
    })
}
