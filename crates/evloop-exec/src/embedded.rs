use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use evloop_core::{
    EventLoop, Job, LoopEvent, LoopEventKind, ScheduledTask, log_event, run_guarded,
};
use evloop_model::{Deadline, TimeAmount};
use tracing::trace;

use crate::queue::{self, TimerQueue};

const LABEL: &str = "embedded";

struct State {
    now: Deadline,
    queue: TimerQueue,
    jobs: VecDeque<Job>,
    shut_down: bool,
}

/// Single-threaded loop driven by virtual time.
///
/// Nothing runs until the caller advances the clock or calls [`EmbeddedEventLoop::run`]; due
/// work then runs synchronously on the caller's stack, in deadline order. The clock starts at
/// uptime zero. Timers go through the generic scheduled-task backend.
#[derive(Clone)]
pub struct EmbeddedEventLoop {
    state: Arc<Mutex<State>>,
}

impl EmbeddedEventLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                now: Deadline::uptime_nanoseconds(0),
                queue: TimerQueue::new(),
                jobs: VecDeque::new(),
                shut_down: false,
            })),
        }
    }

    /// Moves the clock forward by `amount`, firing everything that becomes due on the way.
    pub fn advance_time_by(&self, amount: TimeAmount) {
        let target = self.now() + amount;
        self.advance_time_to(target);
    }

    /// Moves the clock to `deadline`. The clock never goes backwards.
    ///
    /// While a task fires, [`EventLoop::now`] reports that task's deadline; work scheduled
    /// during the pass fires in the same pass if it is due by `deadline`.
    pub fn advance_time_to(&self, deadline: Deadline) {
        let target = deadline.max(self.now());
        loop {
            self.run_jobs();
            let due = {
                let mut st = self.lock();
                match st.queue.pop_due(target) {
                    Some((at, due)) => {
                        st.now = st.now.max(at);
                        due
                    }
                    None => {
                        st.now = target;
                        break;
                    }
                }
            };
            queue::fire(self, due);
        }
        self.run_jobs();
    }

    /// Runs queued jobs and everything due at the current instant.
    pub fn run(&self) {
        self.advance_time_by(TimeAmount::ZERO);
    }

    /// Cancels every pending task; later requests are cancelled on arrival.
    pub fn shutdown(&self) {
        let (drained, jobs) = {
            let mut st = self.lock();
            if st.shut_down {
                return;
            }
            st.shut_down = true;
            log_event(LoopEvent::new(LoopEventKind::ShutdownRequested, LABEL));
            (st.queue.drain(), std::mem::take(&mut st.jobs))
        };

        let cancelled = drained.len();
        for task in drained.tasks {
            task.cancel();
        }
        drop(jobs);
        log_event(LoopEvent::new(LoopEventKind::ShutdownCompleted, LABEL).with_pending(cancelled));
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Number of tasks still waiting for their deadline.
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    fn run_jobs(&self) {
        loop {
            let job = self.lock().jobs.pop_front();
            let Some(job) = job else { break };
            let this: &dyn EventLoop = self;
            run_guarded(LABEL, || job(this));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EmbeddedEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for EmbeddedEventLoop {
    fn now(&self) -> Deadline {
        self.lock().now
    }

    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, job: Job) {
        let mut st = self.lock();
        if st.shut_down {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::JobRejected, LABEL));
            return;
        }
        st.jobs.push_back(job);
    }

    fn schedule(&self, task: Arc<ScheduledTask>) {
        let mut st = self.lock();
        if st.shut_down {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::ScheduleRejected, LABEL));
            task.cancel();
            return;
        }
        trace!(target: "evloop.exec.embedded", deadline = %task.deadline(), "task queued");
        st.queue.push_task(task);
    }

    fn label(&self) -> &str {
        LABEL
    }
}
