//! # tephra-kernel: The deterministic simulation core
//!
//! This crate implements the discrete-event kernel of Tephra:
//!
//! - **Entity registry & lifecycle** ([`EntityRegistry`]): the canonical
//!   doubly-linked sequence of live entities, monotonic identity, soft
//!   delete with restore, and mutation-tolerant cursor iteration.
//! - **Prototype/clone graph**: inheritance of unedited fields through the
//!   prototype chain at read time, plus a bounded reuse pool for generated
//!   clones.
//! - **Event scheduler** ([`Scheduler`]): a tick-based priority queue with
//!   FIFO/LIFO tie-breaks, cancelable handles, conditional waits, and
//!   optional real-time pacing.
//! - **Model controller** ([`ModelController`]): composes one registry and
//!   one scheduler into a runnable model with the
//!   `Idle → Running → Paused → ... → Ended` state machine.
//! - **Blueprints** ([`ModelBlueprint`]): a replayable definition sequence
//!   used to build independent per-thread model copies.
//!
//! The kernel is single-threaded per model instance; determinism is
//! per-run (same seed, same blueprint → same event order → same outputs).

mod blueprint;
mod controller;
mod entity;
mod error;
mod field;
mod process;
mod registry;
mod scheduler;
mod trace;

#[cfg(test)]
mod tests;

pub use blueprint::{DefineOp, ModelBlueprint};
pub use controller::{ModelConfig, ModelController, RunControl, RunState};
pub use entity::Entity;
pub use error::{
    ActionError, KernelError, RuntimeError, StructuralError, ValidationError, ValidationFailure,
};
pub use field::{
    Capability, CapabilitySet, EntityState, FieldDef, FieldPhase, TypeInfo, TypeKey, TypeRegistry,
};
pub use process::{Action, Behavior, Flow, ModelCtx, Predicate, Target};
pub use registry::{Cursor, DisposeOutcome, EntityRegistry, DEFAULT_POOL_CAPACITY};
pub use scheduler::{EventHandle, EventRecord, Scheduler};
pub use trace::{SharedTraceLog, TraceListener};
