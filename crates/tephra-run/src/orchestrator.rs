//! The sweep orchestrator.
//!
//! Drives N×M (scenario × replication) executions across up to
//! `threads` workers. Every worker owns a full independent model instance
//! built by replaying the sweep's blueprint; the only cross-worker state
//! is the run-queue bookkeeping behind one mutex. An errored run is
//! recorded and excluded from statistics; the sweep continues unless the
//! host requests a hard stop or the model definition itself is broken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use tephra_kernel::{KernelError, ModelBlueprint, RunControl, RunState, TypeRegistry};
use tephra_types::{AggregateRow, OutputValue, ReplicationRow, RunId, SweepSummary};

use crate::config::SweepConfig;
use crate::error::SweepError;
use crate::index::{scenario_count, scenario_indices};
use crate::scenario::Scenario;

// ============================================================================
// Outcome
// ============================================================================

/// Everything a finished sweep hands to the reporting layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// One row per replication, in completion order.
    pub rows: Vec<ReplicationRow>,
    /// One row per (scenario, declared output), emitted as each scenario
    /// finishes.
    pub aggregates: Vec<AggregateRow>,
    pub summary: SweepSummary,
}

// ============================================================================
// Shared State
// ============================================================================

struct SweepState {
    scenarios: Vec<Scenario>,
    /// Next scenario number to create, 1-based; scenarios are built
    /// lazily as workers drain earlier ones.
    next_scenario: u64,
    rows: Vec<ReplicationRow>,
    aggregates: Vec<AggregateRow>,
    error_runs: Vec<RunId>,
    completed_runs: u64,
    /// A broken model definition aborts the whole sweep.
    fatal: Option<SweepError>,
}

struct Shared {
    types: Arc<TypeRegistry>,
    blueprint: ModelBlueprint,
    config: SweepConfig,
    scenario_count: u64,
    state: Mutex<SweepState>,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SweepState> {
        // No panics occur while the lock is held.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Sweep driver: owns the type registry, the model blueprint, and the
/// sweep configuration.
pub struct Orchestrator {
    types: Arc<TypeRegistry>,
    blueprint: ModelBlueprint,
    config: SweepConfig,
}

impl Orchestrator {
    pub fn new(
        types: Arc<TypeRegistry>,
        blueprint: ModelBlueprint,
        config: SweepConfig,
    ) -> Result<Self, SweepError> {
        scenario_count(&config.ranges)?;
        if config.replications == 0 {
            return Err(SweepError::NoReplications);
        }
        Ok(Self {
            types,
            blueprint,
            config,
        })
    }

    /// Launches the worker threads and returns immediately.
    pub fn start(&self) -> Result<SweepHandle, SweepError> {
        let scenarios = scenario_count(&self.config.ranges)?;
        let shared = Arc::new(Shared {
            types: Arc::clone(&self.types),
            blueprint: self.blueprint.clone(),
            config: self.config.clone(),
            scenario_count: scenarios,
            state: Mutex::new(SweepState {
                scenarios: Vec::new(),
                next_scenario: 1,
                rows: Vec::new(),
                aggregates: Vec::new(),
                error_runs: Vec::new(),
                completed_runs: 0,
                fatal: None,
            }),
            stop: AtomicBool::new(false),
        });

        let threads = self.config.threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("tephra-worker-{worker}"))
                .spawn(move || worker_loop(&shared))
                .map_err(|e| SweepError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        Ok(SweepHandle {
            shared,
            workers,
            started: Instant::now(),
        })
    }

    /// Runs the whole sweep to completion on the calling thread's watch.
    pub fn run(&self) -> Result<SweepOutcome, SweepError> {
        self.start()?.join()
    }
}

/// Handle on an in-flight sweep: progress, hard stop, and join.
pub struct SweepHandle {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
}

impl SweepHandle {
    /// Overall progress in `[0, 1]`: the sum of per-scenario progress over
    /// the total scenario count. Scenarios not yet created contribute
    /// zero.
    pub fn progress(&self) -> f64 {
        let state = self.shared.lock();
        let done: f64 = state.scenarios.iter().map(Scenario::progress).sum();
        done / self.shared.scenario_count as f64
    }

    /// Requests a hard stop: no further runs start, and every run in
    /// flight is asked to stop cooperatively.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let state = self.shared.lock();
        for scenario in &state.scenarios {
            for run in scenario.in_progress_runs() {
                run.control.request_stop();
            }
        }
        drop(state);
        tracing::info!("sweep hard stop requested");
    }

    /// Waits for every worker and assembles the outcome.
    pub fn join(self) -> Result<SweepOutcome, SweepError> {
        for worker in self.workers {
            worker.join().map_err(|_| SweepError::WorkerPanicked)?;
        }
        let wall_seconds = self.started.elapsed().as_secs_f64();
        let mut state = self.shared.lock();
        if let Some(fatal) = state.fatal.take() {
            return Err(fatal);
        }
        let rows = std::mem::take(&mut state.rows);
        let aggregates = std::mem::take(&mut state.aggregates);
        let error_runs = std::mem::take(&mut state.error_runs);
        let summary = SweepSummary {
            scenarios: self.shared.scenario_count,
            total_runs: self.shared.scenario_count * self.shared.config.replications,
            completed_runs: state.completed_runs,
            error_runs,
            wall_seconds,
        };
        Ok(SweepOutcome {
            rows,
            aggregates,
            summary,
        })
    }
}

// ============================================================================
// Workers
// ============================================================================

enum RunFailure {
    /// The run errored at the dispatch boundary; the sweep continues.
    Runtime(String),
    /// The model definition is broken; the sweep aborts.
    Fatal(SweepError),
}

fn worker_loop(shared: &Shared) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Some((id, control)) = next_run(shared) else {
            break;
        };
        tracing::debug!(
            scenario = id.scenario,
            replication = id.replication,
            "starting run"
        );
        match execute_run(shared, id, &control) {
            Ok(outputs) => complete_run(shared, id, outputs, None),
            Err(RunFailure::Runtime(message)) => {
                complete_run(shared, id, Vec::new(), Some(message));
            }
            Err(RunFailure::Fatal(error)) => {
                tracing::error!(error = %error, "sweep aborted by broken model definition");
                let mut state = shared.lock();
                state.fatal = Some(error);
                drop(state);
                shared.stop.store(true, Ordering::Release);
                break;
            }
        }
    }
}

/// Hands out the next queued run, lazily growing the scenario list. All
/// bookkeeping happens under the single sweep mutex.
fn next_run(shared: &Shared) -> Option<(RunId, RunControl)> {
    let mut state = shared.lock();
    loop {
        if let Some((id, control)) = state
            .scenarios
            .iter_mut()
            .find(|s| s.has_pending())
            .and_then(Scenario::start_next)
        {
            return Some((id, control));
        }
        if state.next_scenario > shared.scenario_count {
            return None;
        }
        let number = state.next_scenario;
        state.next_scenario += 1;
        let indices = match scenario_indices(number, &shared.config.ranges) {
            Ok(indices) => indices,
            Err(_) => return None,
        };
        state.scenarios.push(Scenario::new(
            number,
            indices,
            shared.config.replications,
            &shared.config.outputs,
        ));
    }
}

/// Builds a fresh model copy from the blueprint and runs one replication
/// on the calling worker.
fn execute_run(
    shared: &Shared,
    id: RunId,
    control: &RunControl,
) -> Result<Vec<(String, OutputValue)>, RunFailure> {
    let seed = substream_seed(shared.config.base_seed, id.scenario, id.replication);
    let model_config = shared.config.model.clone().with_seed(seed);

    let mut controller = shared
        .blueprint
        .instantiate(&shared.types, model_config)
        .map_err(|e| RunFailure::Fatal(SweepError::Model(e)))?;
    controller.set_control(control.clone());

    controller.start_up().map_err(|e| match e {
        KernelError::Runtime(err) => RunFailure::Runtime(err.to_string()),
        other => RunFailure::Fatal(SweepError::Kernel(other)),
    })?;

    loop {
        match controller.run() {
            Ok(RunState::Ended) => break,
            Ok(_) => {
                // Paused cooperatively; nothing resumes runs inside a
                // headless sweep besides a stop request.
                if control.is_stop_requested() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(err) => {
                tracing::warn!(
                    scenario = id.scenario,
                    replication = id.replication,
                    tick = %err.tick,
                    error = %err,
                    "run errored"
                );
                return Err(RunFailure::Runtime(err.to_string()));
            }
        }
    }

    controller
        .do_end()
        .map_err(|e| RunFailure::Runtime(e.to_string()))?;
    Ok(controller.take_outputs())
}

/// Records a finished run and, if its scenario is done, emits the
/// scenario's aggregate rows. The "is this scenario finished" check runs
/// under the same lock as the completion itself.
fn complete_run(
    shared: &Shared,
    id: RunId,
    outputs: Vec<(String, OutputValue)>,
    error: Option<String>,
) {
    let mut state = shared.lock();
    let errored = error.is_some();
    state.rows.push(ReplicationRow {
        run: id,
        outputs: outputs.clone(),
        errored,
    });
    if errored {
        state.error_runs.push(id);
    }
    state.completed_runs += 1;

    let Some(pos) = state.scenarios.iter().position(|s| s.number() == id.scenario) else {
        return;
    };
    state.scenarios[pos].complete(id, outputs, error);
    if state.scenarios[pos].is_finished() {
        let rows = state.scenarios[pos].aggregate_rows();
        tracing::info!(scenario = id.scenario, "scenario finished");
        state.aggregates.extend(rows);
    }
}

/// Mixes the sweep's base seed with a run's scenario and replication
/// numbers into an independent substream seed (splitmix finalizer).
pub fn substream_seed(base: u64, scenario: u64, replication: u64) -> u64 {
    let mut x = base
        ^ scenario.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ replication.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
