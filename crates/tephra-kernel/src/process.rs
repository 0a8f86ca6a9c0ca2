//! Cooperative process targets and the dispatch context.
//!
//! A scheduled target is an `(entity, action)` pair. The entity type's
//! [`Behavior`] handles the action and returns a [`Flow`] outcome telling
//! the dispatch loop what to do next: finish, re-enter after a delay, or
//! park on a condition. Multi-step processes are small state machines
//! stepping a phase field between wait points; there is no call-stack
//! suspension.

use rand::rngs::SmallRng;

use tephra_types::{
    EntityId, EventOrder, OutputValue, Priority, Tick, TraceKind, TraceRecord,
};

use crate::error::{ActionError, StructuralError};
use crate::registry::EntityRegistry;
use crate::scheduler::{EventHandle, Scheduler};
use crate::trace::TraceListener;

// ============================================================================
// Targets
// ============================================================================

/// The action a dispatched event asks of its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Begin the entity's process at run start.
    Start,
    /// Discard warm-up statistics.
    ClearStatistics,
    /// A model-defined action code.
    Custom(u32),
}

/// What a scheduled event record fires at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Invoke an entity's behavior with an action.
    Entity { entity: EntityId, action: Action },
    /// Discard warm-up statistics on every live entity.
    StatisticsClear,
    /// Terminate the run.
    EndOfRun,
    /// Cooperatively pause the run between events.
    PauseRequest,
}

impl Target {
    pub fn entity(entity: EntityId, action: Action) -> Self {
        Target::Entity { entity, action }
    }

    /// Human-readable description for traces and error messages.
    pub fn describe(&self, registry: &EntityRegistry) -> String {
        match self {
            Target::Entity { entity, action } => {
                let name = registry
                    .get(*entity)
                    .map_or_else(|| entity.to_string(), |e| e.name().to_string());
                format!("{name}:{action:?}")
            }
            Target::StatisticsClear => "statistics-clear".to_string(),
            Target::EndOfRun => "end-of-run".to_string(),
            Target::PauseRequest => "pause-request".to_string(),
        }
    }
}

// ============================================================================
// Flow Outcomes
// ============================================================================

/// Predicate evaluated against the registry for conditional waits.
pub type Predicate = Box<dyn Fn(&EntityRegistry) -> bool + Send>;

/// Outcome of one behavior invocation: the suspend point it reached.
pub enum Flow {
    /// The process finished; its handle is released.
    Done,
    /// Re-enter the same target after `ticks` ticks.
    Delay {
        ticks: u64,
        priority: Priority,
        order: EventOrder,
    },
    /// Park the target until the predicate holds.
    Until(Predicate),
}

impl Flow {
    /// A delay at normal priority with FIFO tie-break.
    pub fn delay(ticks: u64) -> Self {
        Flow::Delay {
            ticks,
            priority: Priority::NORMAL,
            order: EventOrder::Fifo,
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Done => write!(f, "Done"),
            Flow::Delay {
                ticks,
                priority,
                order,
            } => f
                .debug_struct("Delay")
                .field("ticks", ticks)
                .field("priority", priority)
                .field("order", order)
                .finish(),
            Flow::Until(_) => write!(f, "Until(..)"),
        }
    }
}

// ============================================================================
// Behavior
// ============================================================================

/// Per-type behavior invoked by the model controller. Implementations are
/// stateless: all mutable state lives in the entity's fields, reached
/// through the context.
pub trait Behavior: Send + Sync {
    /// First initialization pass; must not depend on other entities.
    fn early_init(&self, _ctx: &mut ModelCtx<'_>, _me: EntityId) -> Result<(), ActionError> {
        Ok(())
    }

    /// Second initialization pass; may assume `early_init` has completed
    /// everywhere.
    fn late_init(&self, _ctx: &mut ModelCtx<'_>, _me: EntityId) -> Result<(), ActionError> {
        Ok(())
    }

    /// Handles a dispatched action and reports the suspend point reached.
    fn on_event(
        &self,
        _ctx: &mut ModelCtx<'_>,
        _me: EntityId,
        _action: Action,
    ) -> Result<Flow, ActionError> {
        Ok(Flow::Done)
    }

    /// Final reporting pass after the end-of-run event.
    fn do_end(&self, _ctx: &mut ModelCtx<'_>, _me: EntityId) -> Result<(), ActionError> {
        Ok(())
    }
}

// ============================================================================
// Dispatch Context
// ============================================================================

/// Mutable view of the model handed to behavior callbacks: the registry,
/// the scheduler, the replication RNG, declared outputs, and the trace
/// hook. One context lives for exactly one callback invocation.
pub struct ModelCtx<'a> {
    pub registry: &'a mut EntityRegistry,
    pub scheduler: &'a mut Scheduler,
    pub rng: &'a mut SmallRng,
    pub(crate) outputs: &'a mut Vec<(String, OutputValue)>,
    pub(crate) trace: &'a mut Option<Box<dyn TraceListener>>,
}

impl ModelCtx<'_> {
    /// Current simulation time.
    pub fn now(&self) -> Tick {
        self.scheduler.now()
    }

    /// Schedules an entity action `delay` ticks from now. Negative delays
    /// are rejected.
    pub fn schedule(
        &mut self,
        delay: i64,
        priority: Priority,
        order: EventOrder,
        entity: EntityId,
        action: Action,
    ) -> Result<(), StructuralError> {
        self.scheduler
            .schedule_ticks(delay, priority, order, Target::entity(entity, action), None)
    }

    /// Schedules with a handle bound to the new record; an existing record
    /// on the handle is removed first (reschedule semantics).
    pub fn schedule_with_handle(
        &mut self,
        delay: i64,
        priority: Priority,
        order: EventOrder,
        entity: EntityId,
        action: Action,
        handle: EventHandle,
    ) -> Result<(), StructuralError> {
        self.scheduler.schedule_ticks(
            delay,
            priority,
            order,
            Target::entity(entity, action),
            Some(handle),
        )
    }

    /// Allocates a fresh event handle.
    pub fn new_handle(&mut self) -> EventHandle {
        self.scheduler.new_handle()
    }

    /// Cancels the record bound to `handle`, if still pending.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.scheduler.cancel(handle).is_some()
    }

    /// Wakes a blocked process early: its pending record is pulled forward
    /// to the current tick at urgent priority.
    pub fn interrupt(&mut self, entity: EntityId) -> Result<(), StructuralError> {
        let Some(handle) = self.registry.get(entity).and_then(|e| e.process()) else {
            return Ok(());
        };
        let Some(record) = self.scheduler.cancel(handle) else {
            return Ok(());
        };
        let description = record.target.describe(self.registry);
        self.scheduler.schedule_ticks(
            0,
            Priority::URGENT,
            EventOrder::Lifo,
            record.target,
            Some(handle),
        )?;
        self.emit_trace(TraceKind::ProcessInterrupted, Priority::URGENT, description);
        Ok(())
    }

    /// Kills an entity (and recursively its children and registered
    /// clones), canceling any pending process continuations of the killed
    /// set. Idempotent.
    pub fn kill(&mut self, entity: EntityId) {
        let killed = self.registry.kill(entity);
        for id in killed {
            let (name, handle) = match self.registry.get_mut(id) {
                Some(e) => {
                    let h = e.process();
                    e.set_process(None);
                    (e.name().to_string(), h)
                }
                None => continue,
            };
            if let Some(handle) = handle {
                self.scheduler.cancel(handle);
            }
            self.emit_trace(TraceKind::ProcessKilled, Priority::NORMAL, name);
        }
    }

    /// Reverses a kill, restoring the entity subtree.
    pub fn restore(&mut self, entity: EntityId) -> Result<(), StructuralError> {
        self.registry.restore(entity)
    }

    /// Obtains a generated clone of `prototype`, reusing a pooled clone
    /// when one is available.
    pub fn spawn_clone(&mut self, prototype: EntityId) -> Result<EntityId, StructuralError> {
        self.registry.spawn_clone(prototype)
    }

    /// Returns a generated entity to its prototype's pool, or kills it if
    /// the pool is full.
    pub fn dispose(&mut self, entity: EntityId) -> Result<(), StructuralError> {
        self.registry.dispose(entity)?;
        Ok(())
    }

    /// Records a declared output value for the reporting layer.
    pub fn record_output(&mut self, name: impl Into<String>, value: OutputValue) {
        self.outputs.push((name.into(), value));
    }

    /// Emits a trace record to the registered listener, if any.
    pub fn emit_trace(&mut self, kind: TraceKind, priority: Priority, description: String) {
        if let Some(listener) = self.trace.as_mut() {
            listener.record(&TraceRecord {
                tick: self.scheduler.now(),
                priority,
                kind,
                description,
            });
        }
    }
}
