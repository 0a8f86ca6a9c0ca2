//! Sweep-level errors.

use std::path::PathBuf;

use thiserror::Error;

use tephra_kernel::{KernelError, StructuralError};

/// An error raised while orchestrating a scenario sweep. Kernel errors
/// from a single run are *not* sweep errors: an errored run is recorded
/// and the sweep continues. Only malformed configuration and broken model
/// definitions are fatal to the whole sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("scenario index space has no dimensions")]
    EmptyIndexSpace,

    #[error("scenario dimension {0} has zero size")]
    ZeroDimension(usize),

    #[error("index {index} out of range 1..={size} in dimension {dim}")]
    IndexOutOfRange { dim: usize, index: u64, size: u64 },

    #[error("index vector has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("run number {0} is out of range")]
    RunNumberOutOfRange(u64),

    #[error("replications must be at least 1")]
    NoReplications,

    #[error("model definition is broken: {0}")]
    Model(#[from] StructuralError),

    #[error("model failed before dispatch: {0}")]
    Kernel(#[from] KernelError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("failed to read config {path}: {message}")]
    ConfigRead { path: PathBuf, message: String },

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("failed to render report: {0}")]
    Report(String),
}
