//! Background jobs dispatched by the coordinator.
//!
//! Jobs never touch the database. They decode sources and push what they
//! produce onto the coordinator's receive queue, which persists it.

use std::ops::ControlFlow;
use std::sync::Arc;

use flume::Sender;
use tracing::debug;

use super::messages::{Received, ResolvedFile};
use crate::error::{JobError, TileError};
use crate::job::{Job, JobHandle, JobState};
use crate::source::ImageSource;
use crate::store::FileEntry;
use crate::tile::{cut_into_tiles, load_surface, Tile, TilePos};

// =============================================================================
// Tile Generation
// =============================================================================

/// Cuts one source into tiles for a range of scales.
pub(crate) struct TileGenerationJob {
    handle: JobHandle,
    source: Arc<dyn ImageSource>,
    entry: FileEntry,
    min_scale: u32,
    max_scale: u32,
    sink: Sender<Received>,
    error: Option<TileError>,
}

impl TileGenerationJob {
    pub fn new(
        source: Arc<dyn ImageSource>,
        entry: FileEntry,
        min_scale: u32,
        max_scale: u32,
        sink: Sender<Received>,
    ) -> Self {
        Self {
            handle: JobHandle::create(),
            source,
            entry,
            min_scale,
            max_scale,
            sink,
            error: None,
        }
    }

    fn generate(&self) -> Result<(), TileError> {
        let url = self.entry.url();
        let (surface, original_size) = load_surface(self.source.as_ref(), url, self.min_scale)?;

        debug!(
            url = url,
            min_scale = self.min_scale,
            max_scale = self.max_scale,
            "Generating tiles"
        );

        let image_id = self.entry.id();
        let mut disconnected = false;
        let flow = cut_into_tiles(surface, original_size, self.min_scale, self.max_scale, |tile| {
            if self.handle.is_aborted() {
                return ControlFlow::Break(());
            }
            if self.sink.send(Received::Tile { image_id, tile }).is_err() {
                disconnected = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        if flow.is_break() && disconnected {
            return Err(TileError::Disconnected);
        }
        Ok(())
    }

    /// Report the end of the job to the coordinator.
    ///
    /// Called from the job manager's completion callback, whether or not
    /// the job ran.
    pub fn finish(self, ran: bool) {
        let outcome = match (ran, self.handle.state()) {
            (true, JobState::Finished) => Ok(()),
            (_, JobState::Failed) => Err(self.error.unwrap_or_else(|| TileError::Generation {
                url: self.entry.url().to_string(),
                message: "generation job panicked".to_string(),
            })),
            _ => Err(TileError::Aborted),
        };

        let _ = self.sink.send(Received::GenerationDone {
            image_id: self.entry.id(),
            job_id: self.handle.id(),
            outcome,
        });
    }
}

impl Job for TileGenerationJob {
    fn handle(&self) -> &JobHandle {
        &self.handle
    }

    fn run(&mut self) -> Result<(), JobError> {
        self.generate().map_err(|e| {
            let err = JobError::failed(e.to_string());
            self.error = Some(e);
            err
        })
    }
}

// =============================================================================
// File Resolution
// =============================================================================

/// Reads a source's identity and size, and renders its thumbnail tile.
pub(crate) struct FileResolveJob {
    handle: JobHandle,
    source: Arc<dyn ImageSource>,
    url: String,
    sink: Sender<Received>,
    resolved: Option<Result<ResolvedFile, TileError>>,
}

impl FileResolveJob {
    pub fn new(source: Arc<dyn ImageSource>, url: impl Into<String>, sink: Sender<Received>) -> Self {
        Self {
            handle: JobHandle::create(),
            source,
            url: url.into(),
            sink,
            resolved: None,
        }
    }

    fn resolve(&self) -> Result<ResolvedFile, TileError> {
        let stat = self.source.stat(&self.url)?;
        let decoded = self.source.decode(&self.url, 1)?;

        if decoded.original_size.is_empty() {
            return Err(TileError::Generation {
                url: self.url.clone(),
                message: "image has no pixels".to_string(),
            });
        }

        let entry = FileEntry::new(
            self.url.clone(),
            stat.byte_size,
            stat.mtime,
            decoded.original_size,
            decoded.format,
        );

        // The coarsest scale always fits a single tile.
        let max_scale = entry.max_scale();
        let surface = decoded.surface.scale(entry.scaled_size(max_scale));
        let thumbnail = Tile::new(max_scale, TilePos::new(0, 0), surface);

        debug!(
            url = %self.url,
            size = %entry.size(),
            max_scale = max_scale,
            "Resolved file"
        );

        Ok(ResolvedFile { entry, thumbnail })
    }

    pub fn finish(self, ran: bool) {
        let outcome = match self.resolved {
            Some(outcome) if ran => outcome,
            _ => Err(TileError::Aborted),
        };
        let _ = self.sink.send(Received::FileResolved { url: self.url, outcome });
    }
}

impl Job for FileResolveJob {
    fn handle(&self) -> &JobHandle {
        &self.handle
    }

    fn run(&mut self) -> Result<(), JobError> {
        let outcome = self.resolve();
        let result = match &outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(JobError::failed(e.to_string())),
        };
        self.resolved = Some(outcome);
        result
    }
}
