//! Timer scheduling over heterogeneous event loops.
//!
//! A loop implements [`EventLoop`]; [`EventLoop::set_timer`] and [`EventLoopExt`] hand back
//! a [`Timer`] regardless of whether the loop stores timers itself ([`CustomTimerBackend`])
//! or relies on generic [`ScheduledTask`]s.
//! [`Promise`] and [`LoopFuture`] carry single-assignment results, and
//! [`Promise::complete_with_task`] bridges them to cancellable tokio tasks.

pub mod error;
pub use error::LoopError;

pub mod event;
pub use event::{LoopEvent, LoopEventKind, log_event};

mod guard;
pub use guard::run_guarded;

pub mod event_loop;
pub use event_loop::{EventLoop, EventLoopExt, Job};

pub mod scheduled;
pub use scheduled::{Scheduled, ScheduledTask, TaskOutcome, TaskState};

pub mod timer;
pub use timer::{CustomTimerBackend, Timer, TimerHandler};

pub mod promise;
pub use promise::{LoopFuture, Promise};

pub mod bridge;
pub use bridge::{BridgedTaskState, TaskHandle, check_cancelled, sleep};

pub use evloop_model::{Deadline, TimeAmount, TimerId};
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use crate::{
        CancellationToken, Deadline, EventLoop, EventLoopExt, LoopError, LoopFuture, Promise,
        TimeAmount, Timer, TimerHandler,
    };
}
