//! Shared job state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a job.
///
/// `Pending -> Running -> Finished | Failed`, or `Pending | Running -> Aborted`.
/// The last three states are terminal; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Aborted)
    }
}

struct Inner {
    id: u64,
    state: Mutex<JobState>,
    changed: Condvar,
}

/// Reference-counted handle to the state of one job.
///
/// Every clone observes and mutates the same state; all methods are safe to
/// call from any thread. Transitions only happen out of non-terminal states,
/// so a late `set_aborted` on a finished job is a no-op and a job that was
/// aborted while running stays aborted when its body returns.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

impl JobHandle {
    /// Create a handle in the `Pending` state.
    pub fn create() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(JobState::Pending),
                changed: Condvar::new(),
            }),
        }
    }

    /// Process-unique id, for logging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> JobState {
        *self.lock()
    }

    /// Move `Pending -> Running`. Returns `false` if the job may not start.
    pub fn start(&self) -> bool {
        self.transition(|state| (state == JobState::Pending).then_some(JobState::Running))
    }

    /// Abort the job. Returns `true` if this call changed the state.
    pub fn set_aborted(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(JobState::Aborted))
    }

    pub fn set_finished(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(JobState::Finished))
    }

    pub fn set_failed(&self) -> bool {
        self.transition(|state| (!state.is_terminal()).then_some(JobState::Failed))
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == JobState::Aborted
    }

    pub fn is_finished(&self) -> bool {
        self.state() == JobState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == JobState::Failed
    }

    /// `true` once the job reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> JobState {
        let mut state = self.lock();
        while !state.is_terminal() {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `None` if the job is still running when the timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobState> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.is_terminal() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .inner
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Some(*state)
    }

    fn transition(&self, next: impl FnOnce(JobState) -> Option<JobState>) -> bool {
        let mut state = self.lock();
        match next(*state) {
            Some(new_state) => {
                *state = new_state;
                drop(state);
                self.inner.changed.notify_all();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Handle Group
// =============================================================================

/// A set of handles waited on together.
#[derive(Debug, Clone, Default)]
pub struct JobHandleGroup {
    handles: Vec<JobHandle>,
}

impl JobHandleGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: JobHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Block until every handle is done.
    pub fn wait(&self) {
        for handle in &self.handles {
            handle.wait();
        }
    }

    /// Abort every handle that has not finished.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.set_aborted();
        }
    }

    /// Number of handles that ended in the `Failed` state.
    pub fn failed_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_failed()).count()
    }
}

impl Extend<JobHandle> for JobHandleGroup {
    fn extend<T: IntoIterator<Item = JobHandle>>(&mut self, iter: T) {
        self.handles.extend(iter);
    }
}
