//! Worker thread pool.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, error};

use super::JobHandle;
use crate::error::JobError;

/// A unit of background work.
pub trait Job: Send + 'static {
    /// Handle observed by whoever scheduled the job.
    fn handle(&self) -> &JobHandle;

    /// Do the work. Implementations should poll `handle().is_aborted()`
    /// regularly and return early once it is set.
    fn run(&mut self) -> Result<(), JobError>;
}

/// Type-erased queued job.
struct Task {
    handle: JobHandle,
    /// `true` runs the job, `false` discards it unrun.
    body: Box<dyn FnOnce(bool) + Send>,
}

impl Task {
    fn new<J, F>(job: J, callback: F) -> Self
    where
        J: Job,
        F: FnOnce(J, bool) + Send + 'static,
    {
        let handle = job.handle().clone();
        let body = Box::new(move |execute: bool| {
            let mut job = job;
            if !execute || !job.handle().start() {
                callback(job, false);
                return;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| job.run())).unwrap_or_else(|panic| {
                Err(JobError::Panicked {
                    message: panic_message(panic.as_ref()),
                })
            });

            match outcome {
                Ok(()) => {
                    job.handle().set_finished();
                }
                Err(e) => {
                    error!(job = job.handle().id(), "Job failed: {}", e);
                    job.handle().set_failed();
                }
            }

            callback(job, true);
        });

        Self { handle, body }
    }

    fn execute(self) {
        guard_callback(self.handle.id(), || (self.body)(true));
    }

    fn discard(self) {
        self.handle.set_aborted();
        guard_callback(self.handle.id(), || (self.body)(false));
    }
}

fn guard_callback(job_id: u64, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(
            job = job_id,
            "Job completion callback panicked: {}",
            panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum WorkerMessage {
    Run(Task),
    Stop,
}

// =============================================================================
// Worker Thread
// =============================================================================

/// One worker thread with its own queue.
///
/// Queues are unbounded so scheduling never blocks the coordinator thread.
struct JobWorkerThread {
    tx: Sender<WorkerMessage>,
    abort: Arc<AtomicBool>,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JobWorkerThread {
    fn spawn(index: usize) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let abort = Arc::new(AtomicBool::new(false));

        let worker_abort = abort.clone();
        let thread = thread::Builder::new()
            .name(format!("job-worker-{}", index))
            .spawn(move || worker_loop(rx, worker_abort))?;

        Ok(Self {
            tx,
            abort,
            stopping: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, task: Task) {
        if self.stopping.load(Ordering::Acquire) {
            task.discard();
            return;
        }
        if let Err(flume::SendError(WorkerMessage::Run(task))) = self.tx.send(WorkerMessage::Run(task)) {
            task.discard();
        }
    }

    fn stop_thread(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WorkerMessage::Stop);
        }
    }

    fn abort_thread(&self) {
        self.abort.store(true, Ordering::Release);
        self.stop_thread();
    }

    fn join_thread(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(thread) = thread {
            let name = thread.thread().name().unwrap_or("job-worker").to_string();
            if thread.join().is_err() {
                error!(worker = %name, "Worker thread panicked");
            }
        }
    }
}

fn worker_loop(rx: Receiver<WorkerMessage>, abort: Arc<AtomicBool>) {
    debug!("Worker started");

    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::Stop => break,
            WorkerMessage::Run(task) => {
                if abort.load(Ordering::Acquire) || task.handle.is_aborted() {
                    task.discard();
                } else {
                    task.execute();
                }
            }
        }
    }

    // Anything still queued never runs.
    for message in rx.try_iter() {
        if let WorkerMessage::Run(task) = message {
            task.discard();
        }
    }

    debug!("Worker stopped");
}

// =============================================================================
// Job Manager
// =============================================================================

/// Fixed-size pool of worker threads.
///
/// Jobs are assigned to workers round-robin. Every worker has its own queue,
/// so a slow job delays only the jobs queued behind it on the same worker.
pub struct JobManager {
    workers: Vec<JobWorkerThread>,
    next_worker: AtomicUsize,
}

impl JobManager {
    /// Spawn `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a thread.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let workers = (0..threads.max(1))
            .map(JobWorkerThread::spawn)
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(threads = workers.len(), "Job manager started");

        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` on the next worker and return its handle.
    ///
    /// `callback` runs on the worker thread once the job is done. Its second
    /// argument is `false` if the job was discarded without running (aborted
    /// before it started, or the manager is shutting down). Never blocks.
    pub fn request<J, F>(&self, job: J, callback: F) -> JobHandle
    where
        J: Job,
        F: FnOnce(J, bool) + Send + 'static,
    {
        let handle = job.handle().clone();
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].submit(Task::new(job, callback));
        handle
    }

    /// Let queued jobs finish, then stop every worker.
    pub fn stop_thread(&self) {
        for worker in &self.workers {
            worker.stop_thread();
        }
    }

    /// Stop every worker, discarding queued jobs that have not started.
    pub fn abort_thread(&self) {
        for worker in &self.workers {
            worker.abort_thread();
        }
    }

    /// Wait for every worker thread to exit.
    pub fn join_thread(&self) {
        for worker in &self.workers {
            worker.join_thread();
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        let running = self.workers.iter().any(|w| !w.stopping.load(Ordering::Acquire));
        if running {
            debug!("Job manager dropped while running; aborting queued jobs");
        }
        self.abort_thread();
        self.join_thread();
    }
}
