use std::sync::Arc;

use crate::{
    Deadline, LoopError, LoopEvent, LoopEventKind, LoopFuture, Promise, Scheduled, ScheduledTask,
    TaskOutcome, TimeAmount, Timer, TimerHandler, log_event,
};

/// Work submitted with [`EventLoop::execute`]; receives the loop it runs on.
pub type Job = Box<dyn FnOnce(&dyn EventLoop) + Send>;

/// What a loop implementation supplies to the timer facade.
///
/// Every loop is bound to one execution context. Jobs and due tasks run serialized on that
/// context; [`ScheduledTask::cancel`] and [`CustomTimerBackend::cancel_timer`](crate::CustomTimerBackend::cancel_timer)
/// may arrive from anywhere.
pub trait EventLoop: Send + Sync {
    /// Current instant of this loop's clock (virtual for test loops).
    fn now(&self) -> Deadline;

    fn in_event_loop(&self) -> bool;

    /// Runs `job` on the loop as soon as possible. Dropped if the loop is shut down.
    fn execute(&self, job: Job);

    /// Stores `task` and runs it on the loop at or after its deadline. A shut down loop must
    /// cancel the task immediately instead.
    fn schedule(&self, task: Arc<ScheduledTask>);

    /// Fires `handler` once at or after `deadline`, unless the returned timer is cancelled first.
    ///
    /// The default goes through [`EventLoopExt::schedule_task`]. Loops that keep their own
    /// timer storage override it and hand back [`Timer::custom`].
    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> Timer {
        Timer::scheduled(self.schedule_task(deadline, move |event_loop| {
            log_event(LoopEvent::new(LoopEventKind::TimerFired, event_loop.label()));
            handler.timer_fired(event_loop);
            Ok(())
        }))
    }

    /// Short name used in log events.
    fn label(&self) -> &str;
}

/// Caller-facing scheduling API, available on every [`EventLoop`].
pub trait EventLoopExt: EventLoop {
    /// Same as [`EventLoop::set_timer`] with `deadline = self.now() + amount`.
    fn set_timer_in(&self, amount: TimeAmount, handler: Arc<dyn TimerHandler>) -> Timer {
        self.set_timer(self.now() + amount, handler)
    }

    fn schedule_task<T, F>(&self, deadline: Deadline, f: F) -> Scheduled<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn EventLoop) -> Result<T, LoopError> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let task = ScheduledTask::new(deadline, move |outcome| match outcome {
            TaskOutcome::Fired(event_loop) => {
                promise.complete(f(event_loop));
            }
            TaskOutcome::Cancelled => {
                promise.fail(LoopError::Cancelled);
            }
        });
        self.schedule(Arc::clone(&task));
        log_event(LoopEvent::new(LoopEventKind::TaskScheduled, self.label()));
        Scheduled::new(task, future)
    }

    fn schedule_task_in<T, F>(&self, amount: TimeAmount, f: F) -> Scheduled<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn EventLoop) -> Result<T, LoopError> + Send + 'static,
    {
        self.schedule_task(self.now() + amount, f)
    }

    /// Runs `f` on the loop and exposes its result. Fails with `BrokenPromise` if the loop
    /// drops the job.
    fn submit<T, F>(&self, f: F) -> LoopFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn EventLoop) -> Result<T, LoopError> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.execute(Box::new(move |event_loop| {
            promise.complete(f(event_loop));
        }));
        future
    }
}

impl<L: EventLoop + ?Sized> EventLoopExt for L {}
