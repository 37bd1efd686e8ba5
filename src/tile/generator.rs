//! Pyramid cutting.
//!
//! A source is decoded once at the finest scale a job needs, then halved
//! scale by scale. Each scale is cut into `TILE_SIZE` tiles in row-major
//! order, and scales are emitted in ascending order.

use std::ops::ControlFlow;

use tracing::{debug, trace};

use super::{Size, Surface, Tile, TilePos, TILE_SIZE};
use crate::error::SourceError;
use crate::source::ImageSource;

/// Decode `url` and bring it to the size of `min_scale`.
///
/// Decoders may return more pixels than needed; the result is rescaled to
/// the exact target unless it is already within one pixel of it.
///
/// # Returns
///
/// The surface at `min_scale` and the full-resolution size of the source.
pub fn load_surface(
    source: &dyn ImageSource,
    url: &str,
    min_scale: u32,
) -> Result<(Surface, Size), SourceError> {
    let decoded = source.decode(url, 1u32 << min_scale.min(31))?;
    let target = decoded.original_size.downscaled(min_scale);
    let surface = decoded.surface;

    if within_one_pixel(surface.size(), target) {
        return Ok((surface, decoded.original_size));
    }

    debug!(
        url = url,
        decoded = %surface.size(),
        target = %target,
        "Rescaling decoded source to target scale"
    );
    Ok((surface.scale(target), decoded.original_size))
}

fn within_one_pixel(a: Size, b: Size) -> bool {
    a.width.abs_diff(b.width) <= 1 && a.height.abs_diff(b.height) <= 1
}

/// Number of tile columns and rows covering a surface of `size`.
pub fn tile_grid(size: Size) -> (u32, u32) {
    (size.width.div_ceil(TILE_SIZE), size.height.div_ceil(TILE_SIZE))
}

/// Cut `surface` (the source at `min_scale`) into tiles for every scale in
/// `min_scale..=max_scale`.
///
/// `emit` is called once per tile; returning [`ControlFlow::Break`] stops
/// the cut immediately, which is how jobs honour cancellation.
pub fn cut_into_tiles<F>(
    surface: Surface,
    original_size: Size,
    min_scale: u32,
    max_scale: u32,
    mut emit: F,
) -> ControlFlow<()>
where
    F: FnMut(Tile) -> ControlFlow<()>,
{
    let mut surface = surface;

    for scale in min_scale..=max_scale {
        if scale != min_scale {
            surface = surface.halve();
        }

        let (columns, rows) = tile_grid(surface.size());
        trace!(
            scale = scale,
            size = %surface.size(),
            original = %original_size,
            columns = columns,
            rows = rows,
            "Cutting scale"
        );

        for y in 0..rows {
            for x in 0..columns {
                let tile = surface.crop(x * TILE_SIZE, y * TILE_SIZE, TILE_SIZE, TILE_SIZE);
                if emit(Tile::new(scale, TilePos::new(x, y), tile)).is_break() {
                    return ControlFlow::Break(());
                }
            }
        }
    }

    ControlFlow::Continue(())
}
