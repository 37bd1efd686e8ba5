//! Messages carried by the coordinator's two queues.
//!
//! The request queue carries work submitted by callers; the receive queue
//! carries results produced by background jobs. Every request owns the
//! [`JobHandle`] returned to its caller and settles it exactly once.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::error::TileError;
use crate::job::JobHandle;
use crate::store::{FileEntry, RowId};
use crate::tile::{Tile, TilePos};

/// Receives the outcome of a single tile or thumbnail request.
pub type TileCallback = Box<dyn FnOnce(Result<Tile, TileError>) + Send>;

/// Receives every tile produced for a scale range request.
pub type TileStreamCallback = Box<dyn FnMut(Tile) + Send>;

/// Receives the outcome of a file request.
pub type FileCallback = Box<dyn FnOnce(Result<FileEntry, TileError>) + Send>;

/// Receives the outcome of a file listing.
pub type FileListCallback = Box<dyn FnOnce(Result<Vec<FileEntry>, TileError>) + Send>;

/// Run a user callback on the coordinator thread without letting a panic
/// take the thread down.
pub(crate) fn fire(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = what, "Callback panicked");
    }
}

fn settle<T>(handle: &JobHandle, result: &Result<T, TileError>) {
    match result {
        Ok(_) => handle.set_finished(),
        Err(TileError::Aborted | TileError::Disconnected) => handle.set_aborted(),
        Err(_) => handle.set_failed(),
    };
}

// =============================================================================
// Requests
// =============================================================================

pub(crate) struct TileRequest {
    pub entry: FileEntry,
    pub scale: u32,
    pub pos: TilePos,
    pub handle: JobHandle,
    pub callback: TileCallback,
    /// Generation rounds this request has already waited on.
    pub attempts: u32,
}

impl TileRequest {
    pub fn complete(self, result: Result<Tile, TileError>) {
        settle(&self.handle, &result);
        let callback = self.callback;
        fire("tile", move || callback(result));
    }

    pub fn not_found(self) {
        let err = TileError::NotFound {
            image_id: self.entry.id().get(),
            scale: self.scale,
            x: self.pos.x,
            y: self.pos.y,
        };
        self.complete(Err(err));
    }
}

pub(crate) struct RangeRequest {
    pub entry: FileEntry,
    pub min_scale: u32,
    pub max_scale: u32,
    pub handle: JobHandle,
    pub callback: TileStreamCallback,
    pub attempts: u32,
}

impl RangeRequest {
    pub fn covers(&self, scale: u32) -> bool {
        (self.min_scale..=self.max_scale).contains(&scale)
    }

    pub fn deliver(&mut self, tile: &Tile) {
        let tile = tile.clone();
        let callback = &mut self.callback;
        fire("tile range", move || callback(tile));
    }

    pub fn complete(self, result: Result<(), TileError>) {
        settle(&self.handle, &result);
    }
}

pub(crate) struct FileRequest {
    pub url: String,
    pub handle: JobHandle,
    pub file_callback: FileCallback,
    pub tile_callback: Option<TileCallback>,
}

impl FileRequest {
    /// Answer both callbacks. `thumbnail` is only looked at if the file
    /// resolved.
    pub fn complete(self, result: Result<FileEntry, TileError>, thumbnail: impl FnOnce() -> Result<Tile, TileError>) {
        settle(&self.handle, &result);

        if let Some(callback) = self.tile_callback {
            let tile = match &result {
                Ok(_) => thumbnail(),
                Err(e) => Err(e.clone()),
            };
            fire("thumbnail", move || callback(tile));
        }

        let callback = self.file_callback;
        fire("file", move || callback(result));
    }
}

pub(crate) enum Request {
    Tile(TileRequest),
    Tiles(RangeRequest),
    File(FileRequest),
    DeleteFileEntry {
        id: RowId,
        handle: JobHandle,
    },
    AllFiles {
        handle: JobHandle,
        callback: FileListCallback,
    },
    FilesByPattern {
        pattern: String,
        handle: JobHandle,
        callback: FileListCallback,
    },
    Flush {
        handle: JobHandle,
    },
    Shutdown {
        abort: bool,
    },
}

impl Request {
    /// Settle the request without doing its work.
    pub fn fail(self, err: TileError) {
        match self {
            Request::Tile(request) => request.complete(Err(err)),
            Request::Tiles(request) => request.complete(Err(err)),
            Request::File(request) => request.complete(Err(err), || Err(TileError::Aborted)),
            Request::AllFiles { handle, callback } | Request::FilesByPattern { handle, callback, .. } => {
                let result = Err(err);
                settle::<()>(&handle, &result);
                fire("file list", move || callback(result.map(|_| Vec::new())));
            }
            Request::DeleteFileEntry { handle, .. } | Request::Flush { handle } => {
                settle::<()>(&handle, &Err(err));
            }
            Request::Shutdown { .. } => {}
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// A freshly resolved source: its entry (not yet persisted) and the tile
/// at its coarsest scale.
pub(crate) struct ResolvedFile {
    pub entry: FileEntry,
    pub thumbnail: Tile,
}

pub(crate) enum Received {
    /// A tile to persist, from a generation job or [`receive_tile`].
    ///
    /// [`receive_tile`]: super::DatabaseCoordinator::receive_tile
    Tile { image_id: RowId, tile: Tile },

    /// A generation job ended. `Err(Aborted)` if it was cancelled.
    GenerationDone {
        image_id: RowId,
        job_id: u64,
        outcome: Result<(), TileError>,
    },

    /// A file resolution job ended.
    FileResolved {
        url: String,
        outcome: Result<ResolvedFile, TileError>,
    },
}
