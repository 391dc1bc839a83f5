//! Deterministic task scheduler
//!
//! Drives pings, reconnect backoff and deferred callbacks from the event
//! loop. Tasks live in an arena of slots; time-ordered tasks are referenced
//! from a min-heap keyed by `(target, sequence)` so equal targets run in
//! registration order. Cancellation only flags the slot; the heap entry is
//! discarded lazily when it reaches the top.
//!
//! Callbacks receive the loop context `C` and the scheduler itself, so they
//! may schedule or cancel tasks while running.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::error::SchedulerError;

/// Time source for the scheduler
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock for deterministic tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock(Rc<Cell<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

/// Requested delay of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Not time-ordered: an interval runs on every tick, a timeout runs
    /// once on the next tick
    NextTick,
    /// Run once `now + duration` has passed
    After(Duration),
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay::After(d)
    }
}

/// Handle to a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: usize,
    generation: u64,
}

type OnceFn<C> = Box<dyn FnOnce(&mut C, &mut Scheduler<C>)>;
type RepeatFn<C> = Box<dyn FnMut(&mut C, &mut Scheduler<C>)>;

enum TaskFn<C> {
    Once(OnceFn<C>),
    Repeat(RepeatFn<C>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Heap,
    EveryTick,
    NextTick,
}

struct Task<C> {
    label: String,
    queue: Queue,
    period: Option<Duration>,
    callback: Option<TaskFn<C>>,
    cancelled: bool,
    queued: bool,
}

struct Slot<C> {
    generation: u64,
    task: Option<Task<C>>,
}

/// Heap entry: earliest target first, then lowest sequence
type HeapEntry = Reverse<(Instant, u64, usize, u64)>;

/// Single-threaded, cancel-safe timer system
pub struct Scheduler<C> {
    clock: Box<dyn Clock>,
    slots: Vec<Slot<C>>,
    free: Vec<usize>,
    heap: BinaryHeap<HeapEntry>,
    every_tick: Vec<TaskId>,
    next_tick: Vec<TaskId>,
    sequence: u64,
    /// Cancelled tasks still physically queued
    cancelled: usize,
    running: Option<TaskId>,
    poisoned: bool,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            slots: Vec::new(),
            free: Vec::new(),
            heap: BinaryHeap::new(),
            every_tick: Vec::new(),
            next_tick: Vec::new(),
            sequence: 0,
            cancelled: 0,
            running: None,
            poisoned: false,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Run `f` once after `delay`
    ///
    /// A zero delay requested by the task that is currently running, for
    /// the same label, is a self re-arming busy loop: the scheduler is
    /// poisoned and the error surfaces from the current tick.
    pub fn set_timeout<F>(
        &mut self,
        delay: impl Into<Delay>,
        label: impl Into<String>,
        f: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce(&mut C, &mut Scheduler<C>) + 'static,
    {
        let delay = delay.into();
        let label = label.into();

        if delay == Delay::After(Duration::ZERO) {
            if let Some(running) = self.running.and_then(|id| self.task(id)) {
                if running.label == label {
                    error!(task = %label, "Zero-delay task re-armed itself");
                    self.poisoned = true;
                    return Err(SchedulerError::ZeroDelayRearm { label });
                }
            }
        }

        Ok(self.insert(delay, label, None, TaskFn::Once(Box::new(f))))
    }

    /// Run `f` every `period`
    ///
    /// The next target is computed from the time the task actually ran, so
    /// a stalled loop does not replay missed periods.
    pub fn set_interval<F>(
        &mut self,
        period: impl Into<Delay>,
        label: impl Into<String>,
        f: F,
    ) -> TaskId
    where
        F: FnMut(&mut C, &mut Scheduler<C>) + 'static,
    {
        let delay = period.into();
        let label = label.into();
        if delay == Delay::After(Duration::ZERO) {
            warn!(task = %label, "Zero-period interval will spin; use Delay::NextTick");
        }
        let period = match delay {
            Delay::After(d) => Some(d),
            Delay::NextTick => None,
        };
        self.insert(delay, label, period, TaskFn::Repeat(Box::new(f)))
    }

    fn insert(
        &mut self,
        delay: Delay,
        label: String,
        period: Option<Duration>,
        callback: TaskFn<C>,
    ) -> TaskId {
        let queue = match (delay, &callback) {
            (Delay::After(_), _) => Queue::Heap,
            (Delay::NextTick, TaskFn::Repeat(_)) => Queue::EveryTick,
            (Delay::NextTick, TaskFn::Once(_)) => Queue::NextTick,
        };

        let task = Task {
            label,
            queue,
            period,
            callback: Some(callback),
            cancelled: false,
            queued: false,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].task = Some(task);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    task: Some(task),
                });
                self.slots.len() - 1
            }
        };
        let id = TaskId {
            index,
            generation: self.slots[index].generation,
        };

        match (queue, delay) {
            (Queue::Heap, Delay::After(d)) => {
                let target = self.clock.now() + d;
                self.push_heap(id, target);
            }
            (Queue::EveryTick, _) => {
                self.every_tick.push(id);
                self.mark_queued(id, true);
            }
            _ => {
                self.next_tick.push(id);
                self.mark_queued(id, true);
            }
        }
        id
    }

    fn push_heap(&mut self, id: TaskId, target: Instant) {
        self.sequence += 1;
        self.heap
            .push(Reverse((target, self.sequence, id.index, id.generation)));
        self.mark_queued(id, true);
    }

    fn task(&self, id: TaskId) -> Option<&Task<C>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.task.as_ref())
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task<C>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.task.as_mut())
    }

    fn mark_queued(&mut self, id: TaskId, queued: bool) {
        if let Some(task) = self.task_mut(id) {
            task.queued = queued;
        }
    }

    fn release(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(id.index) {
            if slot.generation == id.generation && slot.task.is_some() {
                slot.task = None;
                slot.generation += 1;
                self.free.push(id.index);
            }
        }
    }

    /// Flag a task so it never runs again
    ///
    /// Returns false for unknown or already cancelled tasks. A task that is
    /// currently running finishes its callback and is then dropped.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        if task.cancelled {
            return false;
        }
        task.cancelled = true;
        let queued = task.queued;
        trace!(task = %task.label, "Task cancelled");
        if queued {
            self.cancelled += 1;
        }
        true
    }

    /// Whether the task is still live (scheduled or running, not cancelled)
    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.task(id).is_some_and(|t| !t.cancelled)
    }

    /// Number of live queued tasks
    pub fn len(&self) -> usize {
        (self.heap.len() + self.every_tick.len() + self.next_tick.len())
            .saturating_sub(self.cancelled)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether some task wants to run on every tick
    pub fn has_every_tick(&self) -> bool {
        self.every_tick
            .iter()
            .any(|&id| self.task(id).is_some_and(|t| !t.cancelled))
    }

    /// Run every due task at the clock's current time
    pub fn tick(&mut self, ctx: &mut C) -> Result<Option<Duration>, SchedulerError> {
        let now = self.clock.now();
        self.tick_at(now, ctx)
    }

    /// Run every task due at `now`
    ///
    /// Returns the delay until the next known deadline, `Some(ZERO)` when a
    /// next-tick task is waiting, or `None` when nothing is time-ordered.
    pub fn tick_at(&mut self, now: Instant, ctx: &mut C) -> Result<Option<Duration>, SchedulerError> {
        if self.poisoned {
            return Err(SchedulerError::Poisoned);
        }

        let due = self.collect_due(now);

        for id in due {
            let Some(task) = self.task_mut(id) else {
                continue;
            };
            // cancelled by a callback earlier in this tick
            if task.cancelled {
                if task.queue != Queue::EveryTick {
                    self.release(id);
                }
                continue;
            }
            let Some(callback) = task.callback.take() else {
                continue;
            };

            self.running = Some(id);
            let callback = match callback {
                TaskFn::Once(f) => {
                    f(ctx, self);
                    None
                }
                TaskFn::Repeat(mut f) => {
                    f(ctx, self);
                    Some(TaskFn::Repeat(f))
                }
            };
            self.running = None;

            if self.poisoned {
                let label = self.task(id).map(|t| t.label.clone()).unwrap_or_default();
                return Err(SchedulerError::ZeroDelayRearm { label });
            }

            self.finish(id, callback, now);
        }

        if !self.next_tick.is_empty() {
            return Ok(Some(Duration::ZERO));
        }
        Ok(self
            .next_deadline()
            .map(|target| target.saturating_duration_since(now)))
    }

    fn collect_due(&mut self, now: Instant) -> Vec<TaskId> {
        let mut due = Vec::new();

        while let Some(&Reverse((target, _, index, generation))) = self.heap.peek() {
            let id = TaskId { index, generation };
            let cancelled = self.task(id).map_or(true, |t| t.cancelled);
            if target > now && !cancelled {
                break;
            }
            self.heap.pop();
            self.mark_queued(id, false);
            if cancelled {
                self.discard(id);
            } else {
                due.push(id);
            }
        }

        let every_tick = std::mem::take(&mut self.every_tick);
        for id in every_tick {
            if self.task(id).map_or(true, |t| t.cancelled) {
                self.mark_queued(id, false);
                self.discard(id);
            } else {
                self.every_tick.push(id);
                due.push(id);
            }
        }

        for id in std::mem::take(&mut self.next_tick) {
            self.mark_queued(id, false);
            if self.task(id).map_or(true, |t| t.cancelled) {
                self.discard(id);
            } else {
                due.push(id);
            }
        }

        due
    }

    fn discard(&mut self, id: TaskId) {
        if self.task(id).is_some() {
            self.cancelled = self.cancelled.saturating_sub(1);
        }
        self.release(id);
    }

    fn finish(&mut self, id: TaskId, callback: Option<TaskFn<C>>, now: Instant) {
        let Some(task) = self.task_mut(id) else {
            return;
        };
        let cancelled = task.cancelled;
        let queue = task.queue;
        let period = task.period;
        task.callback = callback;

        match (queue, period) {
            (Queue::EveryTick, _) => {
                // cancelled during its run: still listed, dropped next tick
            }
            (Queue::Heap, Some(period)) if !cancelled => {
                self.push_heap(id, now + period);
            }
            _ => self.release(id),
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((target, _, index, generation))) = self.heap.peek() {
            let id = TaskId { index, generation };
            if self.task(id).map_or(true, |t| t.cancelled) {
                self.heap.pop();
                self.mark_queued(id, false);
                self.discard(id);
                continue;
            }
            return Some(target);
        }
        None
    }
}

impl<C> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.len())
            .field("cancelled", &self.cancelled)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
