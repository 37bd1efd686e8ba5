//! The coordinator's event loop.
//!
//! The loop owns the [`Database`] outright. Every iteration drains the
//! receive queue (results from jobs) before the request queue, so tiles a
//! job just produced are visible to the requests handled right after them.
//!
//! Generation and file resolution are coalesced per image: while a job is in
//! flight for an image, further requests attach to it instead of decoding
//! the source again. When the job ends, requests it did not answer are
//! handled again from scratch, which either finds their tile in the store or
//! starts the next job.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::num::NonZeroUsize;
use std::sync::Arc;

use flume::{Receiver, Sender};
use lru::LruCache;
use tracing::{debug, error, info, trace, warn};

use super::jobs::{FileResolveJob, TileGenerationJob};
use super::messages::{
    fire, FileListCallback, FileRequest, RangeRequest, Received, Request, ResolvedFile, TileRequest,
};
use crate::error::TileError;
use crate::job::{JobHandle, JobManager};
use crate::source::ImageSource;
use crate::store::{Database, FileEntry, RowId};
use crate::tile::{tile_grid, Tile, TilePos};

/// Generation rounds a request may wait on before it gives up.
const MAX_GENERATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    /// Finish in-flight jobs, refuse new requests.
    Stopping,
    Aborting,
}

enum Event {
    Request(Request),
    Received(Received),
    Disconnected,
}

/// An in-flight tile generation job and the requests waiting on it.
struct Generation {
    job: JobHandle,
    entry: FileEntry,
    min_scale: u32,
    max_scale: u32,
    tiles: Vec<TileRequest>,
    ranges: Vec<RangeRequest>,
    /// The image was deleted while the job ran; its tiles are dropped.
    deleted: bool,
}

impl Generation {
    fn deliver(&mut self, tile: &Tile) {
        let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.tiles)
            .into_iter()
            .partition(|r| r.scale == tile.scale() && r.pos == tile.pos());
        self.tiles = waiting;

        for request in ready {
            if request.handle.is_aborted() {
                request.complete(Err(TileError::Aborted));
            } else {
                request.complete(Ok(tile.clone()));
            }
        }

        for request in &mut self.ranges {
            if request.covers(tile.scale()) && !request.handle.is_aborted() {
                request.deliver(tile);
            }
        }
    }

    /// Settle aborted requests. Returns `true` if nobody is waiting any more.
    fn prune(&mut self) -> bool {
        let (aborted, live): (Vec<_>, Vec<_>) = mem::take(&mut self.tiles)
            .into_iter()
            .partition(|r| r.handle.is_aborted());
        self.tiles = live;
        for request in aborted {
            request.complete(Err(TileError::Aborted));
        }

        let (aborted, live): (Vec<_>, Vec<_>) = mem::take(&mut self.ranges)
            .into_iter()
            .partition(|r| r.handle.is_aborted());
        self.ranges = live;
        for request in aborted {
            request.complete(Err(TileError::Aborted));
        }

        self.tiles.is_empty() && self.ranges.is_empty()
    }

    fn fail_all(&mut self, err: &TileError) {
        for request in self.tiles.drain(..) {
            request.complete(Err(err.clone()));
        }
        for request in self.ranges.drain(..) {
            request.complete(Err(err.clone()));
        }
    }
}

/// Per-scale storage state of one image.
struct StoredScales {
    bounds: Option<(u32, u32)>,
    stored: Vec<bool>,
}

impl StoredScales {
    fn is_stored(&self, scale: u32) -> bool {
        self.stored.get(scale as usize).copied().unwrap_or(false)
    }

    /// Grow `scale` into the run of missing scales around it, within
    /// `min..=max`. `scale` itself is always part of the run.
    fn missing_run(&self, scale: u32, min: u32, max: u32) -> (u32, u32) {
        let mut lo = scale;
        while lo > min && !self.is_stored(lo - 1) {
            lo -= 1;
        }
        let mut hi = scale;
        while hi < max && !self.is_stored(hi + 1) {
            hi += 1;
        }
        (lo, hi)
    }

    /// Warn when the stored bounds claim scales of `run`.
    fn warn_if_stale(&self, entry: &FileEntry, (min_scale, max_scale): (u32, u32)) {
        let Some((lo, hi)) = self.bounds else {
            return;
        };
        if min_scale <= hi && lo <= max_scale {
            warn!(
                url = entry.url(),
                min_scale = min_scale,
                max_scale = max_scale,
                stored_min = lo,
                stored_max = hi,
                "Stored scale range is missing tiles, regenerating"
            );
        }
    }
}

/// An in-flight file resolution job and the requests waiting on it.
struct Resolution {
    job: JobHandle,
    waiters: Vec<FileRequest>,
}

pub(crate) struct CoordinatorThread {
    database: Database,
    source: Arc<dyn ImageSource>,
    jobs: JobManager,
    requests: Receiver<Request>,
    received: Receiver<Received>,
    sink: Sender<Received>,
    files: LruCache<String, FileEntry>,
    generations: HashMap<RowId, Generation>,
    resolving: HashMap<String, Resolution>,
    state: RunState,
}

impl CoordinatorThread {
    pub fn new(
        database: Database,
        source: Arc<dyn ImageSource>,
        jobs: JobManager,
        requests: Receiver<Request>,
        (sink, received): (Sender<Received>, Receiver<Received>),
        file_cache: usize,
    ) -> Self {
        Self {
            database,
            source,
            jobs,
            requests,
            received,
            sink,
            files: LruCache::new(NonZeroUsize::new(file_cache).unwrap_or(NonZeroUsize::MIN)),
            generations: HashMap::new(),
            resolving: HashMap::new(),
            state: RunState::Running,
        }
    }

    pub fn run(mut self) {
        info!(workers = self.jobs.thread_count(), "Coordinator started");

        loop {
            while let Ok(message) = self.received.try_recv() {
                self.handle_received(message);
            }
            while let Ok(request) = self.requests.try_recv() {
                self.handle_request(request);
            }

            self.prune();

            match self.state {
                RunState::Aborting => break,
                RunState::Stopping if self.is_idle() => break,
                _ => {}
            }

            match self.wait() {
                Event::Received(message) => self.handle_received(message),
                Event::Request(request) => self.handle_request(request),
                Event::Disconnected => self.state = RunState::Aborting,
            }
        }

        self.shutdown();
    }

    fn wait(&self) -> Event {
        flume::Selector::new()
            .recv(&self.received, |m| m.map_or(Event::Disconnected, Event::Received))
            .recv(&self.requests, |r| r.map_or(Event::Disconnected, Event::Request))
            .wait()
    }

    fn is_idle(&self) -> bool {
        self.generations.is_empty() && self.resolving.is_empty()
    }

    fn shutdown(self) {
        let Self {
            mut database,
            jobs,
            requests,
            received,
            mut generations,
            mut resolving,
            ..
        } = self;

        for request in requests.try_iter() {
            request.fail(TileError::Disconnected);
        }
        let mut deleted = HashSet::new();
        for (id, mut generation) in generations.drain() {
            if generation.deleted {
                deleted.insert(id);
            }
            generation.job.set_aborted();
            generation.fail_all(&TileError::Aborted);
        }
        for (_, resolution) in resolving.drain() {
            resolution.job.set_aborted();
            for waiter in resolution.waiters {
                waiter.complete(Err(TileError::Aborted), || Err(TileError::Aborted));
            }
        }

        // Keep what already arrived, then let blocked jobs fail their sends.
        for message in received.try_iter() {
            if let Received::Tile { image_id, tile } = message {
                if deleted.contains(&image_id) {
                    continue;
                }
                if let Err(e) = database.tiles_mut().store_tile(image_id, &tile) {
                    error!(image = %image_id, "Failed to store tile: {}", e);
                }
            }
        }
        drop(received);

        jobs.abort_thread();
        jobs.join_thread();

        if let Err(e) = database.tiles_mut().flush_cache() {
            error!("Failed to flush tiles: {}", e);
        }
        info!("Coordinator stopped");
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn handle_request(&mut self, request: Request) {
        if let Request::Shutdown { abort } = request {
            self.state = if abort || self.state == RunState::Aborting {
                RunState::Aborting
            } else {
                RunState::Stopping
            };
            debug!(abort = abort, "Coordinator shutting down");
            return;
        }

        if self.state != RunState::Running {
            request.fail(TileError::Disconnected);
            return;
        }

        match request {
            Request::Tile(request) => self.request_tile(request),
            Request::Tiles(request) => self.request_tiles(request),
            Request::File(request) => self.request_file(request),
            Request::DeleteFileEntry { id, handle } => match self.delete_file_entry(id) {
                Ok(()) => {
                    handle.set_finished();
                }
                Err(e) => {
                    error!(image = %id, "Failed to delete file entry: {}", e);
                    handle.set_failed();
                }
            },
            Request::AllFiles { handle, callback } => {
                let result = self.database.files().get_file_entries().map_err(TileError::from);
                answer_list(handle, callback, result);
            }
            Request::FilesByPattern {
                pattern,
                handle,
                callback,
            } => {
                let result = self
                    .database
                    .files()
                    .get_file_entries_by_pattern(&pattern)
                    .map_err(TileError::from);
                answer_list(handle, callback, result);
            }
            Request::Flush { handle } => match self.database.tiles_mut().flush_cache() {
                Ok(()) => {
                    handle.set_finished();
                }
                Err(e) => {
                    error!("Failed to flush tiles: {}", e);
                    handle.set_failed();
                }
            },
            Request::Shutdown { .. } => {}
        }
    }

    fn request_tile(&mut self, request: TileRequest) {
        if request.handle.is_aborted() {
            return request.complete(Err(TileError::Aborted));
        }

        let entry = &request.entry;
        let id = entry.id();
        if !id.is_valid() {
            let url = entry.url().to_string();
            return request.complete(Err(TileError::InvalidImage { url }));
        }
        if request.scale > entry.max_scale() {
            let err = TileError::InvalidScale {
                scale: request.scale,
                max_scale: entry.max_scale(),
            };
            return request.complete(Err(err));
        }

        let (columns, rows) = tile_grid(entry.scaled_size(request.scale));
        if request.pos.x >= columns || request.pos.y >= rows {
            return request.not_found();
        }

        match self.lookup_tile(id, request.scale, request.pos) {
            Ok(Some(tile)) => return request.complete(Ok(tile)),
            Ok(None) => {}
            Err(e) => {
                error!(image = %id, "Tile lookup failed: {}", e);
                return request.complete(Err(e));
            }
        }

        if let Some(generation) = self.generations.get_mut(&id) {
            if generation.deleted {
                let url = entry.url().to_string();
                return request.complete(Err(TileError::InvalidImage { url }));
            }
            generation.tiles.push(request);
            return;
        }

        if request.attempts >= MAX_GENERATION_ATTEMPTS {
            warn!(
                url = entry.url(),
                scale = request.scale,
                pos = %request.pos,
                "Tile still missing after generation"
            );
            return request.not_found();
        }

        if let Err(e) = self.ensure_known(entry) {
            return request.complete(Err(e));
        }
        match self.plan_generation(entry, request.scale) {
            Ok((min_scale, max_scale)) => {
                let entry = entry.clone();
                let generation = self.start_generation(entry, min_scale, max_scale);
                generation.tiles.push(request);
            }
            Err(e) => request.complete(Err(e)),
        }
    }

    fn request_tiles(&mut self, mut request: RangeRequest) {
        if request.handle.is_aborted() {
            return request.complete(Err(TileError::Aborted));
        }

        let entry = &request.entry;
        let id = entry.id();
        if !id.is_valid() {
            let url = entry.url().to_string();
            return request.complete(Err(TileError::InvalidImage { url }));
        }

        request.max_scale = request.max_scale.min(entry.max_scale());
        if request.min_scale > request.max_scale {
            let err = TileError::InvalidScale {
                scale: request.min_scale,
                max_scale: entry.max_scale(),
            };
            return request.complete(Err(err));
        }

        let missing = match self.missing_range(&request) {
            Ok(missing) => missing,
            Err(e) => return request.complete(Err(e)),
        };
        let Some((min_scale, max_scale)) = missing else {
            return request.complete(Ok(()));
        };

        if let Some(generation) = self.generations.get_mut(&id) {
            if generation.deleted {
                let url = entry.url().to_string();
                return request.complete(Err(TileError::InvalidImage { url }));
            }
            generation.ranges.push(request);
            return;
        }

        if request.attempts >= MAX_GENERATION_ATTEMPTS {
            let err = TileError::Generation {
                url: entry.url().to_string(),
                message: format!("scales {}..={} could not be generated", min_scale, max_scale),
            };
            return request.complete(Err(err));
        }
        if let Err(e) = self.ensure_known(entry) {
            return request.complete(Err(e));
        }

        let entry = entry.clone();
        let generation = self.start_generation(entry, min_scale, max_scale);
        generation.ranges.push(request);
    }

    fn request_file(&mut self, request: FileRequest) {
        if request.handle.is_aborted() {
            return request.complete(Err(TileError::Aborted), || Err(TileError::Aborted));
        }

        match self.known_file(&request.url) {
            Ok(Some(entry)) => {
                let thumbnail = self.thumbnail(&entry);
                request.complete(Ok(entry), move || thumbnail);
            }
            Ok(None) => self.resolve_file(request),
            Err(e) => {
                error!(url = %request.url, "File lookup failed: {}", e);
                request.complete(Err(e), || Err(TileError::Aborted));
            }
        }
    }

    // =========================================================================
    // Store Access
    // =========================================================================

    fn lookup_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<Option<Tile>, TileError> {
        let Some(entry) = self.database.tiles().get_tile(image_id, scale, pos)? else {
            return Ok(None);
        };

        match entry.into_tile() {
            Ok(tile) => Ok(Some(tile)),
            Err(e) => {
                warn!(
                    image = %image_id,
                    scale = scale,
                    pos = %pos,
                    "Stored tile is unreadable, regenerating: {}",
                    e
                );
                Ok(None)
            }
        }
    }

    fn thumbnail(&self, entry: &FileEntry) -> Result<Tile, TileError> {
        let scale = entry.max_scale();
        let pos = TilePos::new(0, 0);
        self.lookup_tile(entry.id(), scale, pos)?.ok_or(TileError::NotFound {
            image_id: entry.id().get(),
            scale,
            x: pos.x,
            y: pos.y,
        })
    }

    /// Entries deleted since the caller looked them up get no new tiles.
    fn ensure_known(&self, entry: &FileEntry) -> Result<(), TileError> {
        match self.database.files().get_file_entry_by_id(entry.id())? {
            Some(_) => Ok(()),
            None => Err(TileError::InvalidImage {
                url: entry.url().to_string(),
            }),
        }
    }

    /// Which scales of `entry` are completely stored.
    ///
    /// Tiles of a scale are generated in row-major order, so a scale counts
    /// as stored once its last tile is. Scales outside the stored bounds are
    /// missing without asking the store.
    fn stored_scales(&self, entry: &FileEntry) -> Result<StoredScales, TileError> {
        let tiles = self.database.tiles();
        let bounds = tiles.get_min_max_scale(entry.id())?;

        let mut stored = Vec::with_capacity(entry.max_scale() as usize + 1);
        for scale in 0..=entry.max_scale() {
            let claimed = bounds.is_some_and(|(lo, hi)| (lo..=hi).contains(&scale));
            if !claimed {
                stored.push(false);
                continue;
            }
            let (columns, rows) = tile_grid(entry.scaled_size(scale));
            let last = TilePos::new(columns.saturating_sub(1), rows.saturating_sub(1));
            stored.push(tiles.has_tile(entry.id(), last, scale)?);
        }

        Ok(StoredScales { bounds, stored })
    }

    /// Scales to generate so that `scale` gets produced.
    fn plan_generation(&self, entry: &FileEntry, scale: u32) -> Result<(u32, u32), TileError> {
        let stored = self.stored_scales(entry)?;
        let run = stored.missing_run(scale, 0, entry.max_scale());
        stored.warn_if_stale(entry, run);
        Ok(run)
    }

    /// First contiguous run of scales the request needs that the store does
    /// not have.
    fn missing_range(&self, request: &RangeRequest) -> Result<Option<(u32, u32)>, TileError> {
        let (min, max) = (request.min_scale, request.max_scale);
        let stored = self.stored_scales(&request.entry)?;

        let Some(first) = (min..=max).find(|scale| !stored.is_stored(*scale)) else {
            return Ok(None);
        };
        let run = stored.missing_run(first, first, max);
        stored.warn_if_stale(&request.entry, run);
        Ok(Some(run))
    }

    fn known_file(&mut self, url: &str) -> Result<Option<FileEntry>, TileError> {
        let entry = match self.files.get(url) {
            Some(entry) => entry.clone(),
            None => match self.database.files().get_file_entry(url)? {
                Some(entry) => entry,
                None => return Ok(None),
            },
        };

        match self.source.stat(url) {
            Ok(stat) if entry.matches(stat.byte_size, stat.mtime) => {}
            Ok(_) => {
                info!(url = url, "Source changed since it was recorded, resolving again");
                self.delete_file_entry(entry.id())?;
                return Ok(None);
            }
            Err(e) => {
                debug!(url = url, "Cannot stat source, using stored entry: {}", e);
            }
        }

        self.files.put(url.to_string(), entry.clone());
        Ok(Some(entry))
    }

    fn delete_file_entry(&mut self, id: RowId) -> Result<(), TileError> {
        if let Some(generation) = self.generations.get_mut(&id) {
            generation.job.set_aborted();
            generation.deleted = true;
            generation.fail_all(&TileError::Aborted);
        }

        let stale: Vec<String> = self
            .files
            .iter()
            .filter(|(_, entry)| entry.id() == id)
            .map(|(url, _)| url.clone())
            .collect();
        for url in stale {
            self.files.pop(&url);
        }

        self.database.delete_file_entry(id)?;
        info!(image = %id, "Deleted file entry");
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    fn start_generation(&mut self, entry: FileEntry, min_scale: u32, max_scale: u32) -> &mut Generation {
        let id = entry.id();
        let job = TileGenerationJob::new(self.source.clone(), entry.clone(), min_scale, max_scale, self.sink.clone());
        let handle = self.jobs.request(job, |job, ran| job.finish(ran));

        debug!(
            url = entry.url(),
            job = handle.id(),
            min_scale = min_scale,
            max_scale = max_scale,
            "Scheduled tile generation"
        );

        self.generations.entry(id).or_insert(Generation {
            job: handle,
            entry,
            min_scale,
            max_scale,
            tiles: Vec::new(),
            ranges: Vec::new(),
            deleted: false,
        })
    }

    fn resolve_file(&mut self, request: FileRequest) {
        if let Some(resolution) = self.resolving.get_mut(&request.url) {
            resolution.waiters.push(request);
            return;
        }

        let url = request.url.clone();
        let job = FileResolveJob::new(self.source.clone(), url.clone(), self.sink.clone());
        let handle = self.jobs.request(job, |job, ran| job.finish(ran));
        debug!(url = %url, job = handle.id(), "Scheduled file resolution");

        self.resolving.insert(
            url,
            Resolution {
                job: handle,
                waiters: vec![request],
            },
        );
    }

    /// Abort jobs nobody waits on any more.
    fn prune(&mut self) {
        for generation in self.generations.values_mut() {
            if generation.prune() && generation.job.set_aborted() {
                debug!(
                    url = generation.entry.url(),
                    job = generation.job.id(),
                    "All requests cancelled, aborting generation"
                );
            }
        }

        for (url, resolution) in &mut self.resolving {
            let (aborted, live): (Vec<_>, Vec<_>) = mem::take(&mut resolution.waiters)
                .into_iter()
                .partition(|w| w.handle.is_aborted());
            resolution.waiters = live;
            for waiter in aborted {
                waiter.complete(Err(TileError::Aborted), || Err(TileError::Aborted));
            }
            if resolution.waiters.is_empty() && resolution.job.set_aborted() {
                debug!(url = %url, "All requests cancelled, aborting file resolution");
            }
        }
    }

    // =========================================================================
    // Results
    // =========================================================================

    fn handle_received(&mut self, message: Received) {
        match message {
            Received::Tile { image_id, tile } => self.store_tile(image_id, tile),
            Received::GenerationDone {
                image_id,
                job_id,
                outcome,
            } => self.finish_generation(image_id, job_id, outcome),
            Received::FileResolved { url, outcome } => self.finish_resolution(url, outcome),
        }
    }

    fn store_tile(&mut self, image_id: RowId, tile: Tile) {
        if self.generations.get(&image_id).is_some_and(|g| g.deleted) {
            trace!(image = %image_id, "Dropping tile of deleted image");
            return;
        }

        trace!(image = %image_id, scale = tile.scale(), pos = %tile.pos(), "Storing tile");
        if let Err(e) = self.database.tiles_mut().store_tile(image_id, &tile) {
            error!(image = %image_id, scale = tile.scale(), "Failed to store tile: {}", e);
        }

        if let Some(generation) = self.generations.get_mut(&image_id) {
            generation.deliver(&tile);
        }
    }

    fn finish_generation(&mut self, image_id: RowId, job_id: u64, outcome: Result<(), TileError>) {
        let Some(mut generation) = self.generations.remove(&image_id) else {
            return;
        };

        match outcome {
            Ok(()) => {
                debug!(
                    url = generation.entry.url(),
                    job = job_id,
                    min_scale = generation.min_scale,
                    max_scale = generation.max_scale,
                    "Generation finished"
                );
                self.retry(generation);
            }
            Err(TileError::Aborted) if self.state == RunState::Running && !generation.deleted => {
                debug!(url = generation.entry.url(), job = job_id, "Generation aborted");
                self.retry(generation);
            }
            Err(e) => {
                if !matches!(e, TileError::Aborted) {
                    warn!(url = generation.entry.url(), job = job_id, "Generation failed: {}", e);
                }
                generation.fail_all(&e);
            }
        }
    }

    /// Handle the requests a finished job did not answer once more.
    ///
    /// Only jobs whose scales overlapped a request count as an attempt for
    /// it. Requests that merely waited on a job for other scales start over.
    fn retry(&mut self, generation: Generation) {
        let (min_scale, max_scale) = (generation.min_scale, generation.max_scale);
        for mut request in generation.tiles {
            if (min_scale..=max_scale).contains(&request.scale) {
                request.attempts += 1;
            }
            self.request_tile(request);
        }
        for mut request in generation.ranges {
            if request.min_scale <= max_scale && min_scale <= request.max_scale {
                request.attempts += 1;
            }
            self.request_tiles(request);
        }
    }

    fn finish_resolution(&mut self, url: String, outcome: Result<ResolvedFile, TileError>) {
        let Some(resolution) = self.resolving.remove(&url) else {
            return;
        };

        let result = outcome.and_then(|resolved| self.persist_file(resolved));
        match result {
            Ok((entry, thumbnail)) => {
                for waiter in resolution.waiters {
                    let thumbnail = thumbnail.clone();
                    waiter.complete(Ok(entry.clone()), move || Ok(thumbnail));
                }
            }
            Err(TileError::Aborted) if self.state == RunState::Running => {
                for waiter in resolution.waiters {
                    self.request_file(waiter);
                }
            }
            Err(e) => {
                if !matches!(e, TileError::Aborted) {
                    warn!(url = %url, "Failed to resolve file: {}", e);
                }
                for waiter in resolution.waiters {
                    waiter.complete(Err(e.clone()), || Err(TileError::Aborted));
                }
            }
        }
    }

    fn persist_file(&mut self, resolved: ResolvedFile) -> Result<(FileEntry, Tile), TileError> {
        let entry = self.database.files_mut().store_file_entry(&resolved.entry)?;
        self.database.tiles_mut().store_tile(entry.id(), &resolved.thumbnail)?;
        self.files.put(entry.url().to_string(), entry.clone());

        info!(url = entry.url(), image = %entry.id(), size = %entry.size(), "Stored file entry");
        Ok((entry, resolved.thumbnail))
    }
}

fn answer_list(handle: JobHandle, callback: FileListCallback, result: Result<Vec<FileEntry>, TileError>) {
    if result.is_ok() {
        handle.set_finished();
    } else {
        handle.set_failed();
    }
    fire("file list", move || callback(result));
}
