//! Error taxonomy for the kernel.
//!
//! Three disjoint families, matching how callers must react:
//! - [`StructuralError`]: fatal to the operation that caused it, never
//!   retried (duplicate name, illegal prototype reassignment, bad delay).
//! - [`RuntimeError`]: raised while a scheduled target executes, caught at
//!   the dispatch boundary; marks the run errored without touching sibling
//!   runs.
//! - [`ValidationError`]: aggregated post-load consistency failures; any
//!   failure blocks the run from starting at all.

use thiserror::Error;

use tephra_types::{EntityId, Tick};

// ============================================================================
// Structural Errors
// ============================================================================

/// A malformed structural operation on the model definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("entity named '{0}' already exists in this scope")]
    DuplicateName(String),

    #[error("entity type '{0}' is already registered")]
    DuplicateType(String),

    #[error("unknown entity type '{0}'")]
    UnknownType(String),

    #[error("no entity named '{0}'")]
    UnknownEntityName(String),

    #[error("entity {0} is not defined")]
    MissingEntity(EntityId),

    #[error("prototype of entity {0} is already set")]
    PrototypeAlreadySet(EntityId),

    #[error("prototype type mismatch: entity is '{entity_type}', prototype is '{prototype_type}'")]
    PrototypeTypeMismatch {
        entity_type: String,
        prototype_type: String,
    },

    #[error("unknown field '{field}' on type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    #[error("field '{field}' expects {expected}, got {actual}")]
    FieldType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("cannot schedule a negative delay of {0} ticks")]
    NegativeDelay(i64),

    #[error("dispose requires a generated entity, {0} was defined at load time")]
    DisposeNotGenerated(EntityId),

    #[error("entity {0} is dead")]
    EntityDead(EntityId),
}

// ============================================================================
// Runtime Errors
// ============================================================================

/// An error raised by a scheduled target while it executed. Constructed at
/// the dispatch boundary with the run position attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run failed at tick {tick} dispatching '{target}': {message}")]
pub struct RuntimeError {
    /// Simulation time at which the target was dispatched.
    pub tick: Tick,
    /// Name of the target that failed.
    pub target: String,
    pub message: String,
}

/// An error raised inside a behavior callback. The dispatch loop wraps it
/// into a [`RuntimeError`] carrying the tick and target name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<StructuralError> for ActionError {
    fn from(err: StructuralError) -> Self {
        Self(err.to_string())
    }
}

// ============================================================================
// Validation Errors
// ============================================================================

/// One post-load consistency failure on a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub entity: EntityId,
    pub name: String,
    pub message: String,
}

/// Aggregated validation failures. The model controller refuses to start
/// dispatch while any failure is present.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model validation failed with {} issue(s)", failures.len())]
pub struct ValidationError {
    pub failures: Vec<ValidationFailure>,
}

// ============================================================================
// Umbrella
// ============================================================================

/// Any kernel error, for call sites that can hit more than one family.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
