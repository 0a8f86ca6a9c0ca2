//! Scenarios and their replication runs.
//!
//! A scenario is one point in the sweep's index space with a fixed
//! replication count. It owns three run queues (to-start, in-progress,
//! completed) and a running statistics accumulator per declared output.

use std::collections::{BTreeMap, VecDeque};

use tephra_kernel::RunControl;
use tephra_types::{AggregateRow, OutputValue, RunId};

use crate::index::run_id;
use crate::stats::OutputStats;

/// One replication: its identity, the cooperative control handle of the
/// executing model instance, and its collected results.
#[derive(Debug)]
pub struct ModelRun {
    pub id: RunId,
    pub control: RunControl,
    pub outputs: Vec<(String, OutputValue)>,
    pub errored: bool,
    /// Dispatch-boundary error text, if the run errored.
    pub error: Option<String>,
}

impl ModelRun {
    fn new(id: RunId) -> Self {
        Self {
            id,
            control: RunControl::new(),
            outputs: Vec::new(),
            errored: false,
            error: None,
        }
    }
}

/// One scenario and its replication bookkeeping.
#[derive(Debug)]
pub struct Scenario {
    number: u64,
    indices: Vec<u64>,
    replications: u64,
    to_start: VecDeque<ModelRun>,
    in_progress: Vec<ModelRun>,
    completed: Vec<ModelRun>,
    stats: BTreeMap<String, OutputStats>,
}

impl Scenario {
    /// Builds a scenario with all of its not-yet-started runs queued.
    pub fn new(
        number: u64,
        indices: Vec<u64>,
        replications: u64,
        declared_outputs: &[String],
    ) -> Self {
        let to_start = (1..=replications)
            .map(|rep| ModelRun::new(run_id(number, rep, replications)))
            .collect();
        let stats = declared_outputs
            .iter()
            .map(|name| (name.clone(), OutputStats::new()))
            .collect();
        Self {
            number,
            indices,
            replications,
            to_start,
            in_progress: Vec::new(),
            completed: Vec::new(),
            stats,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// The scenario's position in the index space.
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn replications(&self) -> u64 {
        self.replications
    }

    pub fn has_pending(&self) -> bool {
        !self.to_start.is_empty()
    }

    /// Moves the next queued run into the in-progress set and hands back
    /// its identity and control handle.
    pub fn start_next(&mut self) -> Option<(RunId, RunControl)> {
        let run = self.to_start.pop_front()?;
        let id = run.id;
        let control = run.control.clone();
        self.in_progress.push(run);
        Some((id, control))
    }

    /// Records a finished run. Outputs of non-errored runs feed the
    /// scenario accumulators; errored runs are excluded from statistics.
    pub fn complete(&mut self, id: RunId, outputs: Vec<(String, OutputValue)>, error: Option<String>) {
        let Some(pos) = self.in_progress.iter().position(|r| r.id == id) else {
            return;
        };
        let mut run = self.in_progress.swap_remove(pos);
        run.errored = error.is_some();
        run.error = error;
        run.outputs = outputs;

        if !run.errored {
            for (name, stats) in &mut self.stats {
                if let Some(value) = run
                    .outputs
                    .iter()
                    .find(|(n, _)| n == name)
                    .and_then(|(_, v)| v.as_number())
                {
                    stats.record(value);
                }
            }
        }
        self.completed.push(run);
    }

    /// True once every replication has been started and finished.
    pub fn is_finished(&self) -> bool {
        self.to_start.is_empty() && self.in_progress.is_empty()
    }

    pub fn completed_runs(&self) -> &[ModelRun] {
        &self.completed
    }

    pub fn in_progress_runs(&self) -> &[ModelRun] {
        &self.in_progress
    }

    /// Scenario progress in `[0, 1]`: completed runs plus the duration
    /// fraction of every run in flight, over the replication count.
    pub fn progress(&self) -> f64 {
        if self.replications == 0 {
            return 1.0;
        }
        let in_flight: f64 = self.in_progress.iter().map(|r| r.control.progress()).sum();
        (self.completed.len() as f64 + in_flight) / self.replications as f64
    }

    /// Aggregate rows for every declared output, in declaration order.
    pub fn aggregate_rows(&self) -> Vec<AggregateRow> {
        self.stats
            .iter()
            .map(|(name, stats)| stats.aggregate_row(self.number, name))
            .collect()
    }
}
