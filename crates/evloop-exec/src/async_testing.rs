//! Virtual-time loop living on its own thread.
//!
//! Timer storage sits behind a lock, so `set_timer`, `cancel_timer` and `schedule` take effect
//! immediately from any thread. Time only moves when a caller awaits one of the advancing
//! methods; the move itself happens on the loop thread, so every handler runs there.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use evloop_core::{
    CustomTimerBackend, EventLoop, Job, LoopError, LoopEvent, LoopEventKind, ScheduledTask,
    Timer, TimerHandler, log_event, run_guarded,
};
use evloop_model::{Deadline, TimeAmount, TimerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::queue::{self, TimerQueue};

const LABEL: &str = "async-testing";
const THREAD_NAME: &str = "evloop-async-testing";

enum Target {
    By(TimeAmount),
    To(Deadline),
}

enum Command {
    Advance { target: Target, ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
}

struct State {
    now: Deadline,
    queue: TimerQueue,
    jobs: VecDeque<Job>,
    shut_down: bool,
}

struct Shared {
    state: Mutex<State>,
    next_id: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
    thread: OnceLock<ThreadId>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CustomTimerBackend for Shared {
    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> TimerId {
        let id = TimerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut st = self.lock();
        if st.shut_down {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::ScheduleRejected, LABEL).with_timer(id));
            return id;
        }
        st.queue.push_timer(id, deadline, handler);
        drop(st);
        log_event(LoopEvent::new(LoopEventKind::TimerScheduled, LABEL).with_timer(id));
        id
    }

    fn cancel_timer(&self, id: TimerId) {
        // dropped after the guard: the handler's captured state may call back into this loop
        let handler = self.lock().queue.cancel_timer(id);
        if handler.is_some() {
            log_event(LoopEvent::new(LoopEventKind::TimerCancelled, LABEL).with_timer(id));
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in state.queue.drain().tasks {
            task.cancel();
        }
    }
}

/// Virtual-time loop advanced with `async` calls.
///
/// The clock starts at uptime zero. Timers set through the facade use this loop's own
/// [`CustomTimerBackend`]; generic scheduled tasks are accepted too. Clones drive the same loop.
#[derive(Clone)]
pub struct AsyncTestingEventLoop {
    shared: Arc<Shared>,
}

impl AsyncTestingEventLoop {
    /// Starts the loop thread.
    pub fn new() -> Result<Self, LoopError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                now: Deadline::uptime_nanoseconds(0),
                queue: TimerQueue::new(),
                jobs: VecDeque::new(),
                shut_down: false,
            }),
            next_id: AtomicU64::new(1),
            commands: tx,
            thread: OnceLock::new(),
        });

        let weak = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker(weak, rx))?;
        let _ = shared.thread.set(handle.thread().id());

        debug!(target: "evloop.exec.async_testing", "loop thread started");
        Ok(Self { shared })
    }

    /// Moves the clock forward by `amount` and returns once everything due has run.
    pub async fn advance_time_by(&self, amount: TimeAmount) -> Result<(), LoopError> {
        self.advance(Target::By(amount)).await
    }

    /// Moves the clock to `deadline` (never backwards) and returns once everything due has run.
    pub async fn advance_time_to(&self, deadline: Deadline) -> Result<(), LoopError> {
        self.advance(Target::To(deadline)).await
    }

    /// Runs submitted jobs and everything due at the current instant.
    pub async fn run(&self) -> Result<(), LoopError> {
        self.advance(Target::By(TimeAmount::ZERO)).await
    }

    /// Cancels all pending work on the loop thread. Later requests are cancelled on arrival.
    pub async fn shutdown(&self) -> Result<(), LoopError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown { ack })?;
        done.await.map_err(|_| LoopError::Shutdown)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Number of live timers and tasks.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().queue.len()
    }

    async fn advance(&self, target: Target) -> Result<(), LoopError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Advance { target, ack })?;
        done.await.map_err(|_| LoopError::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), LoopError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| LoopError::Shutdown)
    }
}

impl EventLoop for AsyncTestingEventLoop {
    fn now(&self) -> Deadline {
        self.shared.lock().now
    }

    fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    fn execute(&self, job: Job) {
        let mut st = self.shared.lock();
        if st.shut_down {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::JobRejected, LABEL));
            return;
        }
        st.jobs.push_back(job);
    }

    fn schedule(&self, task: Arc<ScheduledTask>) {
        let mut st = self.shared.lock();
        if st.shut_down {
            drop(st);
            log_event(LoopEvent::new(LoopEventKind::ScheduleRejected, LABEL));
            task.cancel();
            return;
        }
        st.queue.push_task(task);
    }

    fn set_timer(&self, deadline: Deadline, handler: Arc<dyn TimerHandler>) -> Timer {
        let id = self.shared.set_timer(deadline, handler);
        Timer::custom(self.shared.clone(), id)
    }

    fn label(&self) -> &str {
        LABEL
    }
}

/// Loop thread body. Exits once every handle is gone.
fn worker(weak: Weak<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.blocking_recv() {
        let Some(shared) = weak.upgrade() else { break };
        let el = AsyncTestingEventLoop { shared };

        match command {
            Command::Advance { target, ack } => {
                advance(&el, target);
                let _ = ack.send(());
            }
            Command::Shutdown { ack } => {
                shutdown(&el);
                let _ = ack.send(());
            }
        }
    }
    trace!(target: "evloop.exec.async_testing", "loop thread exiting");
}

fn advance(el: &AsyncTestingEventLoop, target: Target) {
    let target = {
        let now = el.now();
        match target {
            Target::By(amount) => now + amount,
            Target::To(deadline) => deadline.max(now),
        }
    };

    loop {
        run_jobs(el);
        let due = {
            let mut st = el.shared.lock();
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
        queue::fire(el, due);
    }
    run_jobs(el);
}

fn run_jobs(el: &AsyncTestingEventLoop) {
    loop {
        let job = el.shared.lock().jobs.pop_front();
        let Some(job) = job else { break };
        let this: &dyn EventLoop = el;
        run_guarded(LABEL, || job(this));
    }
}

fn shutdown(el: &AsyncTestingEventLoop) {
    let (drained, jobs) = {
        let mut st = el.shared.lock();
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
