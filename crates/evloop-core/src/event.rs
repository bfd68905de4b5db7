use std::borrow::Borrow;

use tracing::{debug, error, trace, warn};

use crate::TimerId;

/// Everything an event loop or a promise reports about its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEventKind {
    TimerScheduled,
    TimerFired,
    TimerCancelled,
    TaskScheduled,
    TaskCancelled,
    ScheduleRejected,
    JobRejected,
    HandlerPanicked,
    ShutdownRequested,
    ShutdownCompleted,
    PromiseConflict,
    PromiseBroken,
}

/// A single lifecycle report, tagged with the label of the loop that produced it.
#[derive(Debug, Clone)]
pub struct LoopEvent<'a> {
    pub kind: LoopEventKind,
    pub label: &'a str,
    pub timer: Option<TimerId>,
    pub pending: Option<usize>,
    pub reason: Option<&'a str>,
}

impl<'a> LoopEvent<'a> {
    pub fn new(kind: LoopEventKind, label: &'a str) -> Self {
        Self {
            kind,
            label,
            timer: None,
            pending: None,
            reason: None,
        }
    }

    pub fn with_timer(mut self, id: TimerId) -> Self {
        self.timer = Some(id);
        self
    }

    pub fn with_pending(mut self, pending: usize) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_reason(mut self, reason: &'a str) -> Self {
        self.reason = Some(reason);
        self
    }

    #[inline]
    fn timer_id(&self) -> u64 {
        self.timer.map(|id| id.get()).unwrap_or(0)
    }

    #[inline]
    fn as_reason(&self) -> &str {
        self.reason.unwrap_or("unknown")
    }
}

#[inline]
pub fn message_for(kind: LoopEventKind) -> &'static str {
    match kind {
        // timers
        LoopEventKind::TimerScheduled => "timer scheduled",
        LoopEventKind::TimerFired => "timer fired",
        LoopEventKind::TimerCancelled => "timer cancelled before firing",

        // generic tasks
        LoopEventKind::TaskScheduled => "task scheduled",
        LoopEventKind::TaskCancelled => "scheduled task cancelled",
        LoopEventKind::ScheduleRejected => "schedule request after shutdown; treated as cancelled",
        LoopEventKind::JobRejected => "job submitted after shutdown; dropped",
        LoopEventKind::HandlerPanicked => "handler panicked; loop keeps running",

        // shutdown
        LoopEventKind::ShutdownRequested => "shutdown requested",
        LoopEventKind::ShutdownCompleted => "loop stopped; pending work cancelled",

        // promises
        LoopEventKind::PromiseConflict => "promise already completed; dropping later result",
        LoopEventKind::PromiseBroken => "promise dropped without completion",
    }
}

#[inline]
pub fn log_event<'a, E: Borrow<LoopEvent<'a>>>(e: E) {
    let e = e.borrow();
    let msg = message_for(e.kind);

    match e.kind {
        // hot path
        LoopEventKind::TimerScheduled
        | LoopEventKind::TimerFired
        | LoopEventKind::TimerCancelled
        | LoopEventKind::TaskScheduled
        | LoopEventKind::TaskCancelled => {
            trace!(target: "evloop.core.event", label = e.label, timer = e.timer_id(), "{msg}")
        }
        LoopEventKind::PromiseConflict => trace!(target: "evloop.core.event", "{msg}"),

        // misuse
        LoopEventKind::ScheduleRejected | LoopEventKind::JobRejected => {
            debug!(target: "evloop.core.event", label = e.label, "{msg}")
        }
        LoopEventKind::PromiseBroken => warn!(target: "evloop.core.event", "{msg}"),
        LoopEventKind::HandlerPanicked => {
            error!(target: "evloop.core.event", label = e.label, reason = e.as_reason(), "{msg}")
        }

        // shutdown
        LoopEventKind::ShutdownRequested => {
            debug!(target: "evloop.core.event", label = e.label, "{msg}")
        }
        LoopEventKind::ShutdownCompleted => debug!(
            target: "evloop.core.event",
            label = e.label,
            cancelled = e.pending.unwrap_or(0),
            "{msg}"
        ),
    }
}
