//! The run identity surface: mixed-radix mapping between scenario index
//! vectors and flat scenario/run numbers.
//!
//! A sweep declares a vector of per-dimension index ranges; every scenario
//! is one point in that cross product. Scenario numbers, replication
//! numbers, and combined run numbers are all 1-based and derived
//! deterministically, so external tools can map a run number back to its
//! scenario indices and vice versa.

use serde::{Deserialize, Serialize};

use tephra_types::RunId;

use crate::error::SweepError;

/// One bounded scenario dimension, indexed `1..=size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    size: u64,
}

impl IndexRange {
    pub fn new(size: u64) -> Self {
        Self { size }
    }

    pub fn size(self) -> u64 {
        self.size
    }
}

/// Total number of scenarios in the cross product of `ranges`.
pub fn scenario_count(ranges: &[IndexRange]) -> Result<u64, SweepError> {
    if ranges.is_empty() {
        return Err(SweepError::EmptyIndexSpace);
    }
    let mut count: u64 = 1;
    for (dim, range) in ranges.iter().enumerate() {
        if range.size == 0 {
            return Err(SweepError::ZeroDimension(dim));
        }
        count = count
            .checked_mul(range.size)
            .ok_or(SweepError::RunNumberOutOfRange(u64::MAX))?;
    }
    Ok(count)
}

/// Encodes a 1-based index vector into a 1-based scenario number.
///
/// # Examples
///
/// ```
/// # use tephra_run::{scenario_number, scenario_indices, IndexRange};
/// let ranges = [IndexRange::new(3), IndexRange::new(4)];
/// let n = scenario_number(&[2, 3], &ranges).unwrap();
/// assert_eq!(n, 7); // (2-1)*4 + (3-1) + 1
/// assert_eq!(scenario_indices(n, &ranges).unwrap(), vec![2, 3]);
/// ```
pub fn scenario_number(indices: &[u64], ranges: &[IndexRange]) -> Result<u64, SweepError> {
    scenario_count(ranges)?;
    if indices.len() != ranges.len() {
        return Err(SweepError::DimensionMismatch {
            expected: ranges.len(),
            actual: indices.len(),
        });
    }
    let mut number: u64 = 0;
    for (dim, (&index, range)) in indices.iter().zip(ranges).enumerate() {
        if index == 0 || index > range.size {
            return Err(SweepError::IndexOutOfRange {
                dim,
                index,
                size: range.size,
            });
        }
        number = number * range.size + (index - 1);
    }
    Ok(number + 1)
}

/// Decodes a 1-based scenario number back into its index vector.
pub fn scenario_indices(number: u64, ranges: &[IndexRange]) -> Result<Vec<u64>, SweepError> {
    let count = scenario_count(ranges)?;
    if number == 0 || number > count {
        return Err(SweepError::RunNumberOutOfRange(number));
    }
    let mut rem = number - 1;
    let mut indices = vec![0u64; ranges.len()];
    for (slot, range) in indices.iter_mut().zip(ranges).rev() {
        *slot = rem % range.size + 1;
        rem /= range.size;
    }
    Ok(indices)
}

/// Derives the full run identity for one replication of one scenario.
/// Combined run numbers enumerate replications within a scenario before
/// moving to the next scenario.
pub fn run_id(scenario: u64, replication: u64, replications: u64) -> RunId {
    RunId {
        scenario,
        replication,
        run_number: (scenario - 1) * replications + replication,
    }
}

/// Maps a combined run number back to (scenario, replication).
pub fn split_run_number(
    run_number: u64,
    scenarios: u64,
    replications: u64,
) -> Result<RunId, SweepError> {
    if run_number == 0 || run_number > scenarios * replications {
        return Err(SweepError::RunNumberOutOfRange(run_number));
    }
    let scenario = (run_number - 1) / replications + 1;
    let replication = (run_number - 1) % replications + 1;
    Ok(RunId {
        scenario,
        replication,
        run_number,
    })
}
