//! Per-image tile cache for the consuming thread.
//!
//! A viewer keeps one [`ClientTileCache`] per visible image and drives it
//! from a single thread. Tiles are requested through a [`TileProvider`] and
//! come back on a completion queue that [`ClientTileCache::process_queue`]
//! drains once per frame.
//!
//! # Cancellation
//!
//! Cancelled requests are removed from the cache immediately, without
//! waiting for their jobs to stop. Every request carries an id, and a
//! completion is only accepted by the entry that issued it, so a late
//! result for a cancelled request is dropped even if the same tile has been
//! requested again since.

use std::collections::HashMap;

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use super::{Surface, Tile, TilePos, TileProvider};
use crate::error::TileError;
use crate::job::JobHandle;

/// Scales finer than `max_scale - DEFAULT_KEEP_LEVELS` are evicted by
/// [`ClientTileCache::cleanup`].
pub const DEFAULT_KEEP_LEVELS: u32 = 2;

// =============================================================================
// Cache Key
// =============================================================================

/// A tile of the cached image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub scale: u32,
    pub pos: TilePos,
}

impl CacheKey {
    pub fn new(scale: u32, x: u32, y: u32) -> Self {
        Self {
            scale,
            pos: TilePos::new(x, y),
        }
    }
}

/// Visible tiles at one scale: columns `left..right`, rows `top..bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl TileRect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn contains(&self, pos: TilePos) -> bool {
        (self.left..self.right).contains(&pos.x) && (self.top..self.bottom).contains(&pos.y)
    }
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Requested,
    Succeeded,
    /// The tile could not be produced.
    Failed,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    status: TileStatus,
    handle: JobHandle,
    surface: Option<Surface>,
    request_id: u64,
}

impl CacheEntry {
    pub fn status(&self) -> TileStatus {
        self.status
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }
}

struct Completion {
    key: CacheKey,
    request_id: u64,
    result: Result<Tile, TileError>,
}

// =============================================================================
// Client Tile Cache
// =============================================================================

/// Request state and resident surfaces for the tiles of one image.
///
/// Not thread-safe: the owning thread calls every method. The completion
/// queue is the only part other threads touch.
///
/// # Example
///
/// ```no_run
/// use tile_depot::tile::{ClientTileCache, TileProvider, TileRect, TileStatus};
///
/// fn frame<P: TileProvider>(cache: &mut ClientTileCache<P>, scale: u32) {
///     cache.process_queue();
///     cache.cancel_jobs(TileRect::new(0, 0, 4, 3), scale);
///
///     for y in 0..3 {
///         for x in 0..4 {
///             if cache.request_tile(x, y, scale).status() != TileStatus::Succeeded {
///                 // Draw a coarser placeholder meanwhile.
///                 let _placeholder = cache.find_smaller_tile(x, y, scale);
///             }
///         }
///     }
/// }
/// ```
pub struct ClientTileCache<P: TileProvider> {
    provider: P,
    entries: HashMap<CacheKey, CacheEntry>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    next_request_id: u64,
    min_keep_scale: u32,
}

impl<P: TileProvider> ClientTileCache<P> {
    pub fn new(provider: P) -> Self {
        let min_keep_scale = provider.max_scale().saturating_sub(DEFAULT_KEEP_LEVELS);
        let (completions_tx, completions_rx) = flume::unbounded();
        Self {
            provider,
            entries: HashMap::new(),
            completions_tx,
            completions_rx,
            next_request_id: 1,
            min_keep_scale,
        }
    }

    /// Keep scales at or above `min_keep_scale` resident across [`cleanup`](Self::cleanup).
    pub fn with_min_keep_scale(mut self, min_keep_scale: u32) -> Self {
        self.min_keep_scale = min_keep_scale;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn max_scale(&self) -> u32 {
        self.provider.max_scale()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current state of a tile, requesting it if it is not cached.
    pub fn request_tile(&mut self, x: u32, y: u32, scale: u32) -> &CacheEntry {
        let key = CacheKey::new(scale, x, y);

        self.entries.entry(key).or_insert_with(|| {
            let request_id = self.next_request_id;
            self.next_request_id += 1;

            let tx = self.completions_tx.clone();
            let handle = self.provider.request_tile(
                scale,
                key.pos,
                Box::new(move |result| {
                    let _ = tx.send(Completion {
                        key,
                        request_id,
                        result,
                    });
                }),
            );

            trace!(scale = scale, pos = %key.pos, request = request_id, "Requested tile");
            CacheEntry {
                status: TileStatus::Requested,
                handle,
                surface: None,
                request_id,
            }
        })
    }

    /// Resident surface of a tile, without requesting it.
    pub fn get_tile(&self, x: u32, y: u32, scale: u32) -> Option<&Surface> {
        self.entries
            .get(&CacheKey::new(scale, x, y))
            .filter(|entry| entry.status == TileStatus::Succeeded)
            .and_then(CacheEntry::surface)
    }

    /// Apply finished requests. Call once per frame.
    ///
    /// # Returns
    ///
    /// The number of tiles that became available.
    pub fn process_queue(&mut self) -> usize {
        let mut accepted = 0;

        for completion in self.completions_rx.try_iter() {
            let Some(entry) = self.entries.get_mut(&completion.key) else {
                trace!(pos = %completion.key.pos, "Dropping tile of cancelled request");
                continue;
            };
            if entry.request_id != completion.request_id || entry.status != TileStatus::Requested {
                trace!(pos = %completion.key.pos, "Dropping tile of superseded request");
                continue;
            }

            match completion.result {
                Ok(tile) => {
                    entry.status = TileStatus::Succeeded;
                    entry.surface = Some(tile.into_surface());
                    accepted += 1;
                }
                Err(TileError::Aborted) => {
                    self.entries.remove(&completion.key);
                }
                Err(e) => {
                    debug!(
                        scale = completion.key.scale,
                        pos = %completion.key.pos,
                        "Tile request failed: {}",
                        e
                    );
                    entry.status = TileStatus::Failed;
                }
            }
        }

        accepted
    }

    /// Find a coarser resident tile covering `(x, y)` at `scale`.
    ///
    /// # Returns
    ///
    /// The surface and how many scales coarser it is. `levels` is a level
    /// count, not a pixel factor: the requested tile covers a `1 / 2^levels`
    /// part of the surface in each direction, so a renderer magnifies it by
    /// `1 << levels`.
    pub fn find_smaller_tile(&self, x: u32, y: u32, scale: u32) -> Option<(Surface, u32)> {
        let max_scale = self.provider.max_scale();

        for levels in 1..=max_scale {
            let coarser = scale.checked_add(levels).filter(|s| *s <= max_scale)?;
            let pos = TilePos::new(x, y).coarser(levels);
            if let Some(surface) = self.get_tile(pos.x, pos.y, coarser) {
                return Some((surface.clone(), levels));
            }
        }
        None
    }

    /// Cancel pending requests outside `visible` at `scale`.
    pub fn cancel_jobs(&mut self, visible: TileRect, scale: u32) {
        self.entries.retain(|key, entry| {
            let wanted = key.scale == scale && visible.contains(key.pos);
            if entry.status == TileStatus::Requested && !wanted {
                entry.handle.set_aborted();
                return false;
            }
            true
        });
    }

    /// Release what an off-screen image does not need.
    ///
    /// Cancels every pending request and evicts failed tiles and resident
    /// tiles finer than the keep scale.
    pub fn cleanup(&mut self) {
        let min_keep_scale = self.min_keep_scale;
        self.entries.retain(|key, entry| match entry.status {
            TileStatus::Requested => {
                entry.handle.set_aborted();
                false
            }
            TileStatus::Succeeded => key.scale >= min_keep_scale,
            TileStatus::Failed => false,
        });
    }

    /// Cancel everything and empty the cache.
    pub fn clear(&mut self) {
        for entry in self.entries.values() {
            if entry.status == TileStatus::Requested {
                entry.handle.set_aborted();
            }
        }
        self.entries.clear();
    }
}
