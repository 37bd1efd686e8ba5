//! The database coordinator.
//!
//! One dedicated thread owns the [`Database`]. Everything else talks to it
//! through [`DatabaseCoordinator`], a cheap-to-clone handle whose methods
//! enqueue work and return a [`JobHandle`] immediately.
//!
//! # Architecture
//!
//! ```text
//!   callers ──request queue──▶ ┌──────────────────┐ ──▶ JobManager workers
//!                              │ coordinator loop │       (decode + cut)
//!   workers ──receive queue──▶ │  owns Database   │ ◀──────────┘
//!                              └──────────────────┘
//! ```
//!
//! Callbacks run on the coordinator thread. They should hand their result
//! off (for example onto a channel) and return; a callback that blocks
//! stalls every other request.

mod jobs;
mod messages;
mod thread;

pub use messages::{FileCallback, FileListCallback, TileCallback, TileStreamCallback};

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use flume::Sender;
use tracing::error;

use self::messages::{FileRequest, RangeRequest, Received, Request, TileRequest};
use self::thread::CoordinatorThread;
use crate::config::CoordinatorConfig;
use crate::error::TileError;
use crate::job::{JobHandle, JobManager};
use crate::source::ImageSource;
use crate::store::{Database, FileEntry, RowId};
use crate::tile::{Tile, TilePos};

struct Inner {
    requests: Sender<Request>,
    received: Sender<Received>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(thread) = thread else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            // Dropped from one of our own callbacks; the loop exits on its own.
            return;
        }
        if thread.join().is_err() {
            error!("Coordinator thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown { abort: true });
        self.join();
    }
}

/// Handle to the coordinator thread.
///
/// Clones share one thread. The thread is aborted and joined when the last
/// clone is dropped.
#[derive(Clone)]
pub struct DatabaseCoordinator {
    inner: Arc<Inner>,
}

impl DatabaseCoordinator {
    /// Start the coordinator thread and its worker pool.
    ///
    /// # Arguments
    ///
    /// * `database` - Store the thread takes ownership of
    /// * `source` - Resolves and decodes source URLs for generation jobs
    /// * `config` - Worker count, queue capacities and file cache size
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn spawn(
        database: Database,
        source: Arc<dyn ImageSource>,
        config: &CoordinatorConfig,
    ) -> std::io::Result<Self> {
        let jobs = JobManager::new(config.threads)?;
        let (request_tx, request_rx) = flume::bounded(config.request_queue.max(1));
        let (receive_tx, receive_rx) = flume::bounded(config.receive_queue.max(1));

        let worker = CoordinatorThread::new(
            database,
            source,
            jobs,
            request_rx,
            (receive_tx.clone(), receive_rx),
            config.file_cache,
        );
        let thread = std::thread::Builder::new()
            .name("tile-coordinator".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            inner: Arc::new(Inner {
                requests: request_tx,
                received: receive_tx,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    fn send(&self, request: Request) {
        if let Err(flume::SendError(request)) = self.inner.requests.send(request) {
            request.fail(TileError::Disconnected);
        }
    }

    /// Request one tile.
    ///
    /// A stored tile is answered right away. Otherwise the tile is generated,
    /// joining a generation job already running for the same image if there
    /// is one. `callback` is called exactly once.
    pub fn request_tile<F>(&self, entry: &FileEntry, scale: u32, pos: TilePos, callback: F) -> JobHandle
    where
        F: FnOnce(Result<Tile, TileError>) + Send + 'static,
    {
        let handle = JobHandle::create();
        self.send(Request::Tile(TileRequest {
            entry: entry.clone(),
            scale,
            pos,
            handle: handle.clone(),
            callback: Box::new(callback),
            attempts: 0,
        }));
        handle
    }

    /// Make sure every scale in `min_scale..=max_scale` is stored.
    ///
    /// Scales already covered by the store are skipped. `callback` receives
    /// each tile generated for the range; the handle finishes once the whole
    /// range is stored. `max_scale` is clamped to the image's pyramid.
    pub fn request_tiles<F>(&self, entry: &FileEntry, min_scale: u32, max_scale: u32, callback: F) -> JobHandle
    where
        F: FnMut(Tile) + Send + 'static,
    {
        let handle = JobHandle::create();
        self.send(Request::Tiles(RangeRequest {
            entry: entry.clone(),
            min_scale,
            max_scale,
            handle: handle.clone(),
            callback: Box::new(callback),
            attempts: 0,
        }));
        handle
    }

    /// Look up the entry for `url`, resolving the source if it is unknown
    /// or changed since it was recorded.
    ///
    /// `tile_callback` receives the image's coarsest tile, which is produced
    /// along with a new entry.
    pub fn request_file<F, T>(&self, url: impl Into<String>, file_callback: F, tile_callback: T) -> JobHandle
    where
        F: FnOnce(Result<FileEntry, TileError>) + Send + 'static,
        T: FnOnce(Result<Tile, TileError>) + Send + 'static,
    {
        let handle = JobHandle::create();
        self.send(Request::File(FileRequest {
            url: url.into(),
            handle: handle.clone(),
            file_callback: Box::new(file_callback),
            tile_callback: Some(Box::new(tile_callback)),
        }));
        handle
    }

    /// Persist a tile produced outside the coordinator.
    ///
    /// Blocks while the receive queue is full. Must not be called from a
    /// coordinator callback.
    pub fn receive_tile(&self, image_id: RowId, tile: Tile) -> Result<(), TileError> {
        self.inner
            .received
            .send(Received::Tile { image_id, tile })
            .map_err(|_| TileError::Disconnected)
    }

    /// Remove a file entry and all of its tiles.
    pub fn delete_file_entry(&self, id: RowId) -> JobHandle {
        let handle = JobHandle::create();
        self.send(Request::DeleteFileEntry {
            id,
            handle: handle.clone(),
        });
        handle
    }

    /// List every stored file entry, ordered by URL.
    pub fn request_all_files<F>(&self, callback: F) -> JobHandle
    where
        F: FnOnce(Result<Vec<FileEntry>, TileError>) + Send + 'static,
    {
        let handle = JobHandle::create();
        self.send(Request::AllFiles {
            handle: handle.clone(),
            callback: Box::new(callback),
        });
        handle
    }

    /// List stored file entries whose URL matches a glob pattern.
    pub fn request_files_by_pattern<F>(&self, pattern: impl Into<String>, callback: F) -> JobHandle
    where
        F: FnOnce(Result<Vec<FileEntry>, TileError>) + Send + 'static,
    {
        let handle = JobHandle::create();
        self.send(Request::FilesByPattern {
            pattern: pattern.into(),
            handle: handle.clone(),
            callback: Box::new(callback),
        });
        handle
    }

    /// Write buffered tiles through to durable storage.
    pub fn flush(&self) -> JobHandle {
        let handle = JobHandle::create();
        self.send(Request::Flush {
            handle: handle.clone(),
        });
        handle
    }

    /// Stop once in-flight jobs are done. Later requests fail with
    /// [`TileError::Disconnected`].
    pub fn stop_thread(&self) {
        let _ = self.inner.requests.send(Request::Shutdown { abort: false });
    }

    /// Stop right away, cancelling in-flight jobs.
    pub fn abort_thread(&self) {
        let _ = self.inner.requests.send(Request::Shutdown { abort: true });
    }

    /// Wait for the coordinator thread to exit.
    pub fn join_thread(&self) {
        self.inner.join();
    }
}
