//! Deadline-ordered storage shared by all loops in this crate.
//!
//! Holds generic [`ScheduledTask`]s and custom timers side by side. Entries are ordered by
//! deadline, then by insertion sequence, so equal deadlines fire FIFO. Cancelled entries are
//! skipped when they reach the head of the heap, and the heap is compacted once dead entries
//! outnumber live ones.
//!
//! Handlers and tasks leaving the queue are handed back to the caller: their captured state may
//! run arbitrary code on drop, so they must be dropped after the loop lock is released.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
};

use evloop_core::{
    EventLoop, LoopEvent, LoopEventKind, ScheduledTask, TimerHandler, log_event, run_guarded,
};
use evloop_model::{Deadline, TimerId};

enum Slot {
    Task(Arc<ScheduledTask>),
    Timer(TimerId),
}

struct Entry {
    deadline: Deadline,
    seq: u64,
    slot: Slot,
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap: earliest deadline first, then lowest sequence
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Work that became due.
pub(crate) enum Due {
    Task(Arc<ScheduledTask>),
    Timer {
        id: TimerId,
        handler: Arc<dyn TimerHandler>,
    },
}

/// Runs one due entry on `event_loop`. A panicking handler is logged and contained.
pub(crate) fn fire(event_loop: &dyn EventLoop, due: Due) {
    let label = event_loop.label();
    match due {
        Due::Task(task) => {
            run_guarded(label, || {
                task.run(event_loop);
            });
        }
        Due::Timer { id, handler } => {
            log_event(LoopEvent::new(LoopEventKind::TimerFired, label).with_timer(id));
            run_guarded(label, || handler.timer_fired(event_loop));
        }
    }
}

/// Everything left in the queue at shutdown.
pub(crate) struct Drained {
    pub tasks: Vec<Arc<ScheduledTask>>,
    pub handlers: Vec<Arc<dyn TimerHandler>>,
}

impl Drained {
    pub fn len(&self) -> usize {
        self.tasks.len() + self.handlers.len()
    }
}

/// Smallest heap worth compacting.
const COMPACT_MIN: usize = 64;

pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    timers: HashMap<TimerId, Arc<dyn TimerHandler>>,
    next_seq: u64,
    /// Custom timers cancelled since the last compaction whose entries are still in the heap.
    cancelled: usize,
    /// Heap size that triggers the next compaction on push.
    compact_at: usize,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_seq: 0,
            cancelled: 0,
            compact_at: COMPACT_MIN,
        }
    }

    pub fn push_task(&mut self, task: Arc<ScheduledTask>) {
        let deadline = task.deadline();
        self.push(deadline, Slot::Task(task));
    }

    pub fn push_timer(&mut self, id: TimerId, deadline: Deadline, handler: Arc<dyn TimerHandler>) {
        self.timers.insert(id, handler);
        self.push(deadline, Slot::Timer(id));
    }

    /// Removes a pending timer and returns its handler, or `None` if it already fired or was
    /// cancelled. Drop the handler outside the loop lock.
    pub fn cancel_timer(&mut self, id: TimerId) -> Option<Arc<dyn TimerHandler>> {
        let handler = self.timers.remove(&id)?;
        self.cancelled += 1;
        if self.heap.len() >= COMPACT_MIN && self.cancelled * 2 > self.heap.len() {
            self.compact();
        }
        Some(handler)
    }

    /// Deadline of the earliest live entry.
    pub fn next_deadline(&mut self) -> Option<Deadline> {
        self.prune();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops the earliest live entry whose deadline is at or before `now`.
    ///
    /// A popped custom timer is removed from the live set, so a later `cancel_timer` on it is
    /// a no-op.
    pub fn pop_due(&mut self, now: Deadline) -> Option<(Deadline, Due)> {
        self.prune();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let entry = self.heap.pop()?;
        let due = match entry.slot {
            Slot::Task(task) => Due::Task(task),
            Slot::Timer(id) => {
                let handler = self.timers.remove(&id)?;
                Due::Timer { id, handler }
            }
        };
        Some((entry.deadline, due))
    }

    /// Empties the queue. Tasks are returned so the caller can cancel them outside its lock,
    /// handlers so it can drop them there.
    pub fn drain(&mut self) -> Drained {
        let tasks = self
            .heap
            .drain()
            .filter_map(|e| match e.slot {
                Slot::Task(task) if task.is_pending() => Some(task),
                _ => None,
            })
            .collect();
        let handlers = self.timers.drain().map(|(_, handler)| handler).collect();
        self.cancelled = 0;
        self.compact_at = COMPACT_MIN;
        Drained { tasks, handlers }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let tasks = self
            .heap
            .iter()
            .filter(|e| matches!(&e.slot, Slot::Task(task) if task.is_pending()))
            .count();
        tasks + self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, deadline: Deadline, slot: Slot) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            slot,
        });
        if self.heap.len() >= self.compact_at {
            self.compact();
        }
    }

    /// Drops every cancelled entry. Cancelled tasks already gave up their job, so nothing
    /// user-visible runs here.
    fn compact(&mut self) {
        let timers = &self.timers;
        self.heap.retain(|e| match &e.slot {
            Slot::Task(task) => task.is_pending(),
            Slot::Timer(id) => timers.contains_key(id),
        });
        self.cancelled = 0;
        self.compact_at = (self.heap.len() * 2).max(COMPACT_MIN);
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.heap.len()
    }

    fn is_live(&self, entry: &Entry) -> bool {
        match &entry.slot {
            Slot::Task(task) => task.is_pending(),
            Slot::Timer(id) => self.timers.contains_key(id),
        }
    }

    fn prune(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            if let Some(Entry {
                slot: Slot::Timer(_),
                ..
            }) = self.heap.pop()
            {
                self.cancelled = self.cancelled.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_at(nanos: u64) -> Arc<ScheduledTask> {
        ScheduledTask::new(Deadline::uptime_nanoseconds(nanos), |_| {})
    }

    fn noop_handler() -> Arc<dyn TimerHandler> {
        Arc::new(|_: &dyn EventLoop| {})
    }

    fn deadline_of(due: &(Deadline, Due)) -> u64 {
        due.0.as_uptime_nanos()
    }

    #[test]
    fn pops_in_deadline_then_fifo_order() {
        let mut q = TimerQueue::new();
        q.push_task(task_at(30));
        q.push_timer(TimerId::new(1), Deadline::uptime_nanoseconds(10), noop_handler());
        q.push_task(task_at(10));
        q.push_timer(TimerId::new(2), Deadline::uptime_nanoseconds(10), noop_handler());

        let now = Deadline::uptime_nanoseconds(100);
        let first = q.pop_due(now).unwrap();
        assert_eq!(deadline_of(&first), 10);
        assert!(matches!(first.1, Due::Timer { id, .. } if id == TimerId::new(1)));

        let second = q.pop_due(now).unwrap();
        assert!(matches!(second.1, Due::Task(_)));

        let third = q.pop_due(now).unwrap();
        assert!(matches!(third.1, Due::Timer { id, .. } if id == TimerId::new(2)));

        assert_eq!(deadline_of(&q.pop_due(now).unwrap()), 30);
        assert!(q.pop_due(now).is_none());
    }

    #[test]
    fn respects_the_current_time() {
        let mut q = TimerQueue::new();
        q.push_task(task_at(42));

        assert!(q.pop_due(Deadline::uptime_nanoseconds(41)).is_none());
        assert_eq!(q.next_deadline(), Some(Deadline::uptime_nanoseconds(42)));
        assert!(q.pop_due(Deadline::uptime_nanoseconds(42)).is_some());
        assert!(q.next_deadline().is_none());
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut q = TimerQueue::new();
        let task = task_at(5);
        q.push_task(Arc::clone(&task));
        q.push_timer(TimerId::new(9), Deadline::uptime_nanoseconds(6), noop_handler());
        q.push_task(task_at(7));
        assert_eq!(q.len(), 3);

        task.cancel();
        assert!(q.cancel_timer(TimerId::new(9)).is_some());
        assert!(q.cancel_timer(TimerId::new(9)).is_none());
        assert_eq!(q.len(), 1);

        assert_eq!(q.next_deadline(), Some(Deadline::uptime_nanoseconds(7)));
        let due = q.pop_due(Deadline::distant_future()).unwrap();
        assert_eq!(deadline_of(&due), 7);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_returns_pending_tasks_and_counts_timers() {
        let mut q = TimerQueue::new();
        let cancelled = task_at(1);
        q.push_task(Arc::clone(&cancelled));
        q.push_task(task_at(2));
        q.push_timer(TimerId::new(1), Deadline::uptime_nanoseconds(3), noop_handler());
        cancelled.cancel();

        let drained = q.drain();
        assert_eq!(drained.tasks.len(), 1);
        assert_eq!(drained.handlers.len(), 1);
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert!(q.pop_due(Deadline::distant_future()).is_none());
    }

    #[test]
    fn cancelled_entries_behind_a_live_head_are_compacted() {
        let mut q = TimerQueue::new();
        q.push_timer(TimerId::new(0), Deadline::uptime_nanoseconds(1), noop_handler());

        for n in 1..=100_000u64 {
            let id = TimerId::new(n);
            q.push_timer(id, Deadline::distant_future(), noop_handler());
            assert!(q.cancel_timer(id).is_some());

            let task = task_at(1_000 + n);
            q.push_task(Arc::clone(&task));
            task.cancel();
        }

        assert!(q.stored() <= 2 * COMPACT_MIN, "heap kept {} entries", q.stored());
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(Deadline::uptime_nanoseconds(1)));
        assert!(q.pop_due(Deadline::distant_future()).is_some());
        assert!(q.pop_due(Deadline::distant_future()).is_none());
    }

    #[test]
    fn bulk_cancellation_compacts_without_further_pushes() {
        let mut q = TimerQueue::new();
        for n in 0..1_000u64 {
            q.push_timer(TimerId::new(n), Deadline::uptime_nanoseconds(n), noop_handler());
        }
        for n in 1..1_000u64 {
            assert!(q.cancel_timer(TimerId::new(n)).is_some());
        }
        assert!(q.stored() <= 2 * COMPACT_MIN, "heap kept {} entries", q.stored());
        assert_eq!(q.len(), 1);
    }
}
