//! # tephra-run: Scenario/replication orchestration
//!
//! Drives a Tephra model through an N×M (scenario × replication) sweep:
//!
//! - **Run identity**: mixed-radix mapping between scenario index vectors
//!   and flat scenario/run numbers ([`scenario_number`],
//!   [`scenario_indices`]).
//! - **Scenarios** ([`Scenario`]): replication run queues plus running
//!   mean/variance accumulators per declared output ([`OutputStats`]).
//! - **Orchestrator** ([`Orchestrator`]): worker threads, one independent
//!   blueprint-replayed model instance per run, single-mutex bookkeeping,
//!   95% confidence aggregate rows, error-run surfacing.
//! - **Headless runner**: the `sweep` binary with TOML configuration
//!   ([`SweepConfig`]) and human/JSON output.

pub mod cli;
mod config;
pub mod demo;
mod error;
mod index;
mod orchestrator;
mod scenario;
mod stats;

pub use config::SweepConfig;
pub use error::SweepError;
pub use index::{
    run_id, scenario_count, scenario_indices, scenario_number, split_run_number, IndexRange,
};
pub use orchestrator::{substream_seed, Orchestrator, SweepHandle, SweepOutcome};
pub use scenario::{ModelRun, Scenario};
pub use stats::{student_t_975, OutputStats};
