//! Event loops backed by real OS threads and the monotonic clock.

mod group;
pub use group::MultiThreadedEventLoopGroup;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use evloop_core::{
    CustomTimerBackend, EventLoop, Job, LoopError, LoopEvent, LoopEventKind, ScheduledTask,
    Timer, TimerHandler, log_event, run_guarded,
};
use evloop_model::{Deadline, TimerId};
use tracing::{debug, trace};

use crate::queue::{self, Due, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    ShuttingDown,
    Stopped,
}

struct State {
    queue: TimerQueue,
    jobs: VecDeque<Job>,
    lifecycle: Lifecycle,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wakeup: Condvar,
    next_id: AtomicU64,
    thread: OnceLock<ThreadId>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(st: &State) -> bool {
        st.lifecycle == Lifecycle::Running
    }
}

impl CustomTimerBackend for Shared {
    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> TimerId {
        let id = TimerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut st = self.lock();
        if !Shared::is_running(&st) {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::ScheduleRejected, &self.name).with_timer(id));
            return id;
        }
        st.queue.push_timer(id, deadline, handler);
        drop(st);
        self.wakeup.notify_one();
        log_event(LoopEvent::new(LoopEventKind::TimerScheduled, &self.name).with_timer(id));
        id
    }

    fn cancel_timer(&self, id: TimerId) {
        // the loop thread pops under the same lock, so a removed timer can no longer fire;
        // the handler is dropped after the guard since its captured state may call back in
        let handler = self.lock().queue.cancel_timer(id);
        if handler.is_some() {
            log_event(LoopEvent::new(LoopEventKind::TimerCancelled, &self.name).with_timer(id));
        }
    }
}

enum Work {
    Due(Due),
    Job(Job),
    Stop,
}

/// One loop bound to one named OS thread.
///
/// Jobs and due timers run serialized on that thread. Cloning is cheap and every clone refers
/// to the same loop. Loops are created and shut down by a [`MultiThreadedEventLoopGroup`].
#[derive(Clone)]
pub struct ThreadedEventLoop {
    shared: Arc<Shared>,
}

impl ThreadedEventLoop {
    pub(crate) fn spawn(name: String) -> Result<(Self, JoinHandle<()>), LoopError> {
        let el = Self {
            shared: Arc::new(Shared {
                name: name.clone(),
                state: Mutex::new(State {
                    queue: TimerQueue::new(),
                    jobs: VecDeque::new(),
                    lifecycle: Lifecycle::Running,
                }),
                wakeup: Condvar::new(),
                next_id: AtomicU64::new(1),
                thread: OnceLock::new(),
            }),
        };

        let worker = el.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())?;
        let _ = el.shared.thread.set(handle.thread().id());

        debug!(target: "evloop.exec.threaded", name = %el.shared.name, "loop thread started");
        Ok((el, handle))
    }

    /// Asks the loop thread to cancel its pending work and exit. Idempotent.
    pub(crate) fn signal_shutdown(&self) {
        {
            let mut st = self.shared.lock();
            if st.lifecycle != Lifecycle::Running {
                return;
            }
            st.lifecycle = Lifecycle::ShuttingDown;
        }
        self.shared.wakeup.notify_all();
        log_event(LoopEvent::new(LoopEventKind::ShutdownRequested, &self.shared.name));
    }

    pub fn is_shut_down(&self) -> bool {
        !Shared::is_running(&self.shared.lock())
    }

    /// Number of live timers and tasks.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn run(&self) {
        loop {
            match self.next_work() {
                Work::Due(due) => queue::fire(self, due),
                Work::Job(job) => {
                    let this: &dyn EventLoop = self;
                    run_guarded(&self.shared.name, || job(this));
                }
                Work::Stop => break,
            }
        }
        self.stop();
    }

    /// Blocks until a timer is due, a job arrives or shutdown is requested.
    fn next_work(&self) -> Work {
        let shared = &self.shared;
        let mut st = shared.lock();
        loop {
            if !Shared::is_running(&st) {
                return Work::Stop;
            }

            let now = Deadline::now();
            if let Some((_, due)) = st.queue.pop_due(now) {
                return Work::Due(due);
            }
            if let Some(job) = st.jobs.pop_front() {
                return Work::Job(job);
            }

            st = match st.queue.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    match shared.wakeup.wait_timeout(st, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => shared
                    .wakeup
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Cancels, never fires, everything still queued.
    fn stop(&self) {
        let (drained, jobs) = {
            let mut st = self.shared.lock();
            st.lifecycle = Lifecycle::Stopped;
            (st.queue.drain(), std::mem::take(&mut st.jobs))
        };

        let cancelled = drained.len();
        for task in drained.tasks {
            task.cancel();
        }
        if !jobs.is_empty() {
            trace!(target: "evloop.exec.threaded", dropped = jobs.len(), "dropping queued jobs");
        }
        drop(jobs);
        log_event(
            LoopEvent::new(LoopEventKind::ShutdownCompleted, &self.shared.name)
                .with_pending(cancelled),
        );
    }
}

impl EventLoop for ThreadedEventLoop {
    fn now(&self) -> Deadline {
        Deadline::now()
    }

    fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    fn execute(&self, job: Job) {
        let mut st = self.shared.lock();
        if !Shared::is_running(&st) {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::JobRejected, &self.shared.name));
            return;
        }
        st.jobs.push_back(job);
        drop(st);
        self.shared.wakeup.notify_one();
    }

    fn schedule(&self, task: Arc<ScheduledTask>) {
        let mut st = self.shared.lock();
        if !Shared::is_running(&st) {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::ScheduleRejected, &self.shared.name));
            task.cancel();
            return;
        }
        st.queue.push_task(task);
        drop(st);
        self.shared.wakeup.notify_one();
    }

    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> Timer {
        let id = self.shared.set_timer(deadline, handler);
        Timer::custom(self.shared.clone(), id)
    }

    fn label(&self) -> &str {
        &self.shared.name
    }
}
