use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
};

use crate::{Deadline, EventLoop, LoopEvent, LoopEventKind, LoopFuture, log_event};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

const LABEL: &str = "scheduled-task";

/// Lifecycle of a [`ScheduledTask`]. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fired,
    Cancelled,
}

/// How a scheduled job is consumed: run on its loop, or cancelled on whichever context won.
pub enum TaskOutcome<'a> {
    Fired(&'a dyn EventLoop),
    Cancelled,
}

type TaskJob = Box<dyn FnOnce(TaskOutcome<'_>) + Send>;

/// A one-shot unit of work bound to a deadline.
///
/// The state cell moves `Pending -> Fired` or `Pending -> Cancelled` through a single
/// compare-and-swap; whichever side wins consumes the job, the other becomes a no-op.
/// Loops call [`ScheduledTask::run`] on their own context; anyone may call
/// [`ScheduledTask::cancel`].
pub struct ScheduledTask {
    deadline: Deadline,
    state: AtomicU8,
    job: Mutex<Option<TaskJob>>,
}

impl ScheduledTask {
    pub fn new<F>(deadline: Deadline, job: F) -> Arc<Self>
    where
        F: FnOnce(TaskOutcome<'_>) + Send + 'static,
    {
        Arc::new(Self {
            deadline,
            state: AtomicU8::new(PENDING),
            job: Mutex::new(Some(Box::new(job))),
        })
    }

    #[inline]
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            PENDING => TaskState::Pending,
            FIRED => TaskState::Fired,
            _ => TaskState::Cancelled,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Fires the job on `event_loop`. Returns `false` if the task was already cancelled or fired.
    pub fn run(&self, event_loop: &dyn EventLoop) -> bool {
        if !self.transition(FIRED) {
            return false;
        }
        if let Some(job) = self.take_job() {
            job(TaskOutcome::Fired(event_loop));
        }
        true
    }

    /// Returns `true` if this call prevented the job from ever firing.
    pub fn cancel(&self) -> bool {
        if !self.transition(CANCELLED) {
            return false;
        }
        log_event(LoopEvent::new(LoopEventKind::TaskCancelled, LABEL));
        if let Some(job) = self.take_job() {
            job(TaskOutcome::Cancelled);
        }
        true
    }

    #[inline]
    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_job(&self) -> Option<TaskJob> {
        self.job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("deadline", &self.deadline)
            .field("state", &self.state())
            .finish()
    }
}

/// Caller-side handle of a generic scheduled task and the future of its result.
///
/// The future fails with [`LoopError::Cancelled`](crate::LoopError::Cancelled) when
/// cancellation wins, including cancellation by loop shutdown.
pub struct Scheduled<T> {
    task: Arc<ScheduledTask>,
    future: LoopFuture<T>,
}

impl<T> Scheduled<T> {
    pub fn new(task: Arc<ScheduledTask>, future: LoopFuture<T>) -> Self {
        Self { task, future }
    }

    /// Idempotent; a no-op once the task has fired.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn future(&self) -> &LoopFuture<T> {
        &self.future
    }

    pub fn deadline(&self) -> Deadline {
        self.task.deadline()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }
}

impl<T> Clone for Scheduled<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            future: self.future.clone(),
        }
    }
}

impl<T> fmt::Debug for Scheduled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduled").field("task", &self.task).finish()
    }
}
