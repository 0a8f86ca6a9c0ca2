//! The event scheduler: a tick-based priority queue over a logical clock.
//!
//! Total dispatch order is (tick ascending, priority ascending, insertion
//! order). The FIFO/LIFO tie-break among events sharing (tick, priority)
//! is encoded with one global insertion counter offset around a midpoint:
//! FIFO records take `MIDPOINT + n` (back of the bucket at schedule time),
//! LIFO records take `MIDPOINT - n` (front of the bucket), so a single
//! `BTreeMap` key ordering covers both without per-bucket chains.

use std::collections::{BTreeMap, HashMap};

use tephra_types::{EventOrder, Priority, Tick};

use crate::error::StructuralError;
use crate::process::{Predicate, Target};
use crate::registry::EntityRegistry;

// ============================================================================
// Keys, Handles, Records
// ============================================================================

/// Total-order key of a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    tick: Tick,
    priority: Priority,
    seq: u64,
}

const SEQ_MIDPOINT: u64 = 1 << 63;

/// Cancellation/reschedule handle. At most one live record is bound to a
/// handle at a time; scheduling again on the same handle removes the old
/// record first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// One scheduled unit of work.
#[derive(Debug)]
pub struct EventRecord {
    pub target: Target,
    handle: Option<EventHandle>,
}

/// A parked conditional wait.
struct ConditionWait {
    target: Target,
    predicate: Predicate,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Priority event queue plus the logical clock of one model instance.
/// Strictly single-threaded cooperative dispatch: the controller pops one
/// record at a time and runs its target to completion.
pub struct Scheduler {
    now: Tick,
    queue: BTreeMap<EventKey, EventRecord>,
    handles: HashMap<EventHandle, EventKey>,
    waits: Vec<ConditionWait>,
    next_handle: u64,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now: Tick::ZERO,
            queue: BTreeMap::new(),
            handles: HashMap::new(),
            waits: Vec::new(),
            next_handle: 1,
            next_seq: 1,
        }
    }

    /// Current simulation time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of pending event records.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of parked conditional waits.
    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    /// Allocates a fresh, unbound handle.
    pub fn new_handle(&mut self) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Inserts an event record at `now + delay`. A negative delay is
    /// rejected. `order` picks the FIFO or LIFO tie-break among events
    /// sharing (tick, priority). If `handle` is bound to a pending record,
    /// that record is removed first (reschedule semantics).
    pub fn schedule_ticks(
        &mut self,
        delay: i64,
        priority: Priority,
        order: EventOrder,
        target: Target,
        handle: Option<EventHandle>,
    ) -> Result<(), StructuralError> {
        if delay < 0 {
            return Err(StructuralError::NegativeDelay(delay));
        }
        let tick = Tick::new(self.now.value() + delay as u64);
        self.schedule_at(tick, priority, order, target, handle);
        Ok(())
    }

    fn schedule_at(
        &mut self,
        tick: Tick,
        priority: Priority,
        order: EventOrder,
        target: Target,
        handle: Option<EventHandle>,
    ) {
        if let Some(h) = handle {
            self.cancel(h);
        }
        let n = self.next_seq;
        self.next_seq += 1;
        let seq = match order {
            EventOrder::Fifo => SEQ_MIDPOINT + n,
            EventOrder::Lifo => SEQ_MIDPOINT - n,
        };
        let key = EventKey {
            tick,
            priority,
            seq,
        };
        if let Some(h) = handle {
            self.handles.insert(h, key);
        }
        self.queue.insert(key, EventRecord { target, handle });
    }

    /// Removes and returns the record bound to `handle`, if still pending.
    /// Safe to call at any time, including from within the very event the
    /// handle targets (the binding is consumed before invocation, so that
    /// case is a no-op).
    pub fn cancel(&mut self, handle: EventHandle) -> Option<EventRecord> {
        let key = self.handles.remove(&handle)?;
        self.queue.remove(&key)
    }

    /// True if `handle` is bound to a pending record.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.handles.contains_key(&handle)
    }

    /// Tick of the earliest pending record.
    pub fn peek_tick(&self) -> Option<Tick> {
        self.queue.keys().next().map(|k| k.tick)
    }

    /// Pops the lowest-ordered pending record and advances the clock to
    /// its tick. Targets dispatched from the returned record may schedule
    /// further events at the same tick; those run before the clock moves
    /// again.
    pub fn pop_next(&mut self) -> Option<(Tick, Priority, EventRecord)> {
        let (key, record) = self.queue.pop_first()?;
        if let Some(h) = record.handle {
            self.handles.remove(&h);
        }
        debug_assert!(key.tick >= self.now, "event queue went backwards");
        self.now = key.tick;
        Some((key.tick, key.priority, record))
    }

    /// Parks a target until `predicate` holds. The predicate is
    /// re-evaluated opportunistically (at tick boundaries and on
    /// condition-changed signals); once it holds the target is dispatched
    /// exactly once and deregistered.
    pub fn schedule_until(&mut self, target: Target, predicate: Predicate) {
        self.waits.push(ConditionWait { target, predicate });
    }

    /// Evaluates all parked waits against the registry, removing and
    /// returning the targets whose predicates now hold.
    pub fn take_ready_waits(&mut self, registry: &EntityRegistry) -> Vec<Target> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.waits.len() {
            if (self.waits[i].predicate)(registry) {
                ready.push(self.waits.swap_remove(i).target);
            } else {
                i += 1;
            }
        }
        ready
    }

    /// Drops every pending record, handle binding, and parked wait, and
    /// rewinds the clock. Used by model reset between replications.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.handles.clear();
        self.waits.clear();
        self.now = Tick::ZERO;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now)
            .field("pending", &self.queue.len())
            .field("waits", &self.waits.len())
            .finish_non_exhaustive()
    }
}
