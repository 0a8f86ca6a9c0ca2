//! Sweep configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use tephra_kernel::ModelConfig;

use crate::error::SweepError;
use crate::index::IndexRange;

/// Configuration of one scenario sweep: the index space, the replication
/// count, worker parallelism, seeding, the declared outputs to aggregate,
/// and the per-instance model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Scenario index ranges (cross product spans the scenario space).
    pub ranges: Vec<IndexRange>,
    /// Replications per scenario.
    pub replications: u64,
    /// Worker threads, each owning one independent model instance.
    pub threads: usize,
    /// Base seed; each run derives an independent substream from it.
    pub base_seed: u64,
    /// Declared outputs to aggregate per scenario.
    pub outputs: Vec<String>,
    /// Model instance configuration.
    pub model: ModelConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ranges: vec![IndexRange::new(1)],
            replications: 1,
            threads: 1,
            base_seed: 0,
            outputs: Vec::new(),
            model: ModelConfig::default(),
        }
    }
}

impl SweepConfig {
    pub fn with_ranges(mut self, ranges: Vec<IndexRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_replications(mut self, replications: u64) -> Self {
        self.replications = replications;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_base_seed(mut self, base_seed: u64) -> Self {
        self.base_seed = base_seed;
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.outputs.push(output.to_string());
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    /// Parses a TOML sweep configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, SweepError> {
        toml::from_str(text).map_err(|e| SweepError::ConfigParse(e.to_string()))
    }

    /// Loads a TOML sweep configuration from disk.
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let text = std::fs::read_to_string(path).map_err(|e| SweepError::ConfigRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }
}
