use std::{fmt, sync::Arc};

use crate::{Deadline, EventLoop, Scheduled, TimerId};

/// Callback invoked once when a timer set through [`EventLoop::set_timer`] fires.
pub trait TimerHandler: Send + Sync {
    fn timer_fired(&self, event_loop: &dyn EventLoop);
}

impl<F> TimerHandler for F
where
    F: Fn(&dyn EventLoop) + Send + Sync,
{
    #[inline]
    fn timer_fired(&self, event_loop: &dyn EventLoop) {
        self(event_loop)
    }
}

/// Extension point for loops that keep their own timer bookkeeping.
///
/// Both operations may be called from any thread. `set_timer` must return without waiting for
/// the deadline, and `cancel_timer` must be idempotent and must guarantee that a timer it
/// removes never fires.
pub trait CustomTimerBackend: Send + Sync {
    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> TimerId;
    fn cancel_timer(&self, id: TimerId);
}

/// Opaque, cheaply cloneable handle to one pending timer.
///
/// Clones refer to the same timer; cancelling any of them cancels it. Cancellation never
/// fails: after the timer fired, or after its loop shut down, it is a no-op.
#[derive(Clone)]
pub struct Timer {
    backing: Backing,
}

#[derive(Clone)]
enum Backing {
    /// Generic task created through `EventLoopExt::schedule_task`.
    Scheduled(Scheduled<()>),
    /// Id issued by a loop implementing [`CustomTimerBackend`].
    Custom {
        backend: Arc<dyn CustomTimerBackend>,
        id: TimerId,
    },
}

impl Timer {
    pub(crate) fn scheduled(task: Scheduled<()>) -> Self {
        Self {
            backing: Backing::Scheduled(task),
        }
    }

    /// Handle for timer `id` issued by `backend`. Used by loops overriding
    /// [`EventLoop::set_timer`].
    pub fn custom(backend: Arc<dyn CustomTimerBackend>, id: TimerId) -> Self {
        Self {
            backing: Backing::Custom { backend, id },
        }
    }

    #[inline]
    pub fn cancel(&self) {
        match &self.backing {
            Backing::Scheduled(task) => task.cancel(),
            Backing::Custom { backend, id } => backend.cancel_timer(*id),
        }
    }

    /// Id of a custom-backed timer; `None` for generic ones.
    pub fn id(&self) -> Option<TimerId> {
        match &self.backing {
            Backing::Scheduled(_) => None,
            Backing::Custom { id, .. } => Some(*id),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self.backing, Backing::Custom { .. })
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backing {
            Backing::Scheduled(task) => f.debug_tuple("Timer::Scheduled").field(task).finish(),
            Backing::Custom { id, .. } => f.debug_tuple("Timer::Custom").field(id).finish(),
        }
    }
}
