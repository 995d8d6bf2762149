//! Merge arity tuning.
//!
//! The I/O cost of a complete external sort is treated as a black-box function of the merge arity.
//! [`AritySearch`] narrows the arity interval with ternary probes and finishes with a linear scan of
//! the remaining narrow interval.
//!
//! The narrowing phase assumes the cost curve is roughly unimodal over the searched interval. Block
//! alignment effects can produce several local minima, in which case the search may settle on a
//! local one.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log;
use serde::{Deserialize, Serialize};

use crate::config::{SearchConfig, SortConfig, MIN_SEARCH_THRESHOLD};
use crate::sort::{ExternalSorter, SortError};

/// Cost of sorting the reference inputs with one arity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArityCost {
    /// Mean number of I/O operations over the reference inputs.
    pub io: u64,
    /// Number of I/O operations for each reference input.
    pub per_input: Vec<u64>,
}

impl ArityCost {
    /// Builds a cost from per-input measurements using their integer mean.
    pub fn from_samples(per_input: Vec<u64>) -> Self {
        let io = if per_input.is_empty() {
            0
        } else {
            per_input.iter().sum::<u64>() / per_input.len() as u64
        };
        ArityCost { io, per_input }
    }
}

/// Cost function searched by [`AritySearch`].
pub trait CostFunction: Sync {
    /// Evaluates the I/O cost of sorting with the given arity.
    fn evaluate(&self, arity: usize) -> Result<ArityCost, SortError>;
}

impl<F> CostFunction for F
where
    F: Fn(usize) -> Result<u64, SortError> + Sync,
{
    fn evaluate(&self, arity: usize) -> Result<ArityCost, SortError> {
        Ok(ArityCost::from_samples(vec![self(arity)?]))
    }
}

/// Evaluated costs of a set of reference inputs, persisted between searches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTable {
    pub config: SortConfig,
    pub inputs: Vec<PathBuf>,
    pub costs: BTreeMap<usize, ArityCost>,
}

enum OutputDir {
    /// Probe outputs are kept as `sorted_<arity>.bin`.
    Keep(PathBuf),
    /// Probe outputs are removed right after being measured.
    Scratch(tempfile::TempDir),
}

impl OutputDir {
    fn path(&self) -> &Path {
        match self {
            OutputDir::Keep(path) => path,
            OutputDir::Scratch(dir) => dir.path(),
        }
    }
}

/// Measures the cost of an arity by externally sorting fixed reference inputs.
///
/// When more than one input is given the cost is the mean over all inputs.
pub struct SortCostOracle {
    sorter: ExternalSorter,
    inputs: Vec<PathBuf>,
    output_dir: OutputDir,
    memo: Option<Mutex<BTreeMap<usize, ArityCost>>>,
}

impl SortCostOracle {
    /// Creates an oracle with memoization enabled and discarded sort outputs.
    pub fn new(sorter: ExternalSorter, inputs: Vec<PathBuf>) -> Result<Self, SortError> {
        if inputs.is_empty() {
            return Err(SortError::InvalidConfig("no reference input given".to_string()));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("arity-outputs-");
        let output_dir = match sorter.tmp_dir() {
            Some(tmp_path) => builder.tempdir_in(tmp_path),
            None => builder.tempdir(),
        }
        .map_err(SortError::TempDir)?;

        return Ok(SortCostOracle {
            sorter,
            inputs,
            output_dir: OutputDir::Scratch(output_dir),
            memo: Some(Mutex::new(BTreeMap::new())),
        });
    }

    /// Enables or disables memoization of evaluated arities.
    pub fn with_memo(mut self, enabled: bool) -> Self {
        self.memo = if enabled {
            Some(Mutex::new(BTreeMap::new()))
        } else {
            None
        };
        return self;
    }

    /// Keeps every sorted output in `dir` instead of discarding it.
    pub fn keep_outputs(mut self, dir: &Path) -> Result<Self, SortError> {
        fs::create_dir_all(dir).map_err(SortError::IO)?;
        self.output_dir = OutputDir::Keep(dir.to_path_buf());
        return Ok(self);
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Forgets every memoized cost.
    pub fn clear_memo(&self) {
        if let Some(memo) = &self.memo {
            lock(memo).clear();
        }
    }

    /// Snapshot of the memoized costs.
    pub fn cost_table(&self) -> CostTable {
        let costs = match &self.memo {
            Some(memo) => lock(memo).clone(),
            None => BTreeMap::new(),
        };
        CostTable {
            config: *self.sorter.config(),
            inputs: self.inputs.clone(),
            costs,
        }
    }

    /// Seeds the memo with previously evaluated costs.
    /// The table is ignored if it was measured with a different configuration or inputs.
    /// Returns whether the table was used.
    pub fn load_cost_table(&self, table: CostTable) -> bool {
        let memo = match &self.memo {
            Some(memo) => memo,
            None => return false,
        };
        if table.config != *self.sorter.config() || table.inputs != self.inputs {
            log::warn!("cost table measured with different settings, ignoring it");
            return false;
        }

        log::info!("loaded {} memoized arity costs", table.costs.len());
        lock(memo).extend(table.costs);
        return true;
    }

    fn output_path(&self, arity: usize, input_idx: usize) -> PathBuf {
        let name = if self.inputs.len() == 1 {
            format!("sorted_{}.bin", arity)
        } else {
            format!("sorted_{}_{}.bin", arity, input_idx + 1)
        };
        self.output_dir.path().join(name)
    }

    fn measure(&self, arity: usize) -> Result<ArityCost, SortError> {
        let mut per_input = Vec::with_capacity(self.inputs.len());

        for (idx, input) in self.inputs.iter().enumerate() {
            let output = self.output_path(arity, idx);
            let stats = self.sorter.sort(input, &output, arity)?;
            per_input.push(stats.io_operations());

            if let OutputDir::Scratch(_) = self.output_dir {
                fs::remove_file(&output).map_err(SortError::IO)?;
            }
        }

        return Ok(ArityCost::from_samples(per_input));
    }
}

impl CostFunction for SortCostOracle {
    fn evaluate(&self, arity: usize) -> Result<ArityCost, SortError> {
        if let Some(memo) = &self.memo {
            if let Some(cost) = lock(memo).get(&arity) {
                log::debug!("arity {}: memoized cost {}", arity, cost.io);
                return Ok(cost.clone());
            }
        }

        let cost = self.measure(arity)?;

        if let Some(memo) = &self.memo {
            lock(memo).insert(arity, cost.clone());
        }
        return Ok(cost);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One cost function evaluation performed by the search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub arity: usize,
    pub cost: ArityCost,
}

/// Outcome of an arity search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReport {
    /// Arity with the lowest observed cost.
    pub best_arity: usize,
    /// Lowest observed cost.
    pub best_cost: u64,
    /// Interval scanned linearly after narrowing.
    pub final_interval: (usize, usize),
    /// Every evaluation in the order it was performed.
    pub evaluations: Vec<Evaluation>,
}

impl SearchReport {
    /// Observed cost of each evaluated arity.
    pub fn costs(&self) -> BTreeMap<usize, u64> {
        self.evaluations
            .iter()
            .map(|evaluation| (evaluation.arity, evaluation.cost.io))
            .collect()
    }
}

/// Ternary arity search followed by a linear scan.
pub struct AritySearch {
    config: SearchConfig,
}

impl AritySearch {
    pub fn new(config: SearchConfig) -> Self {
        AritySearch { config }
    }

    /// Picks the two interior probes of `[left, right]`.
    /// Falls back to a split around the midpoint when the interval is too narrow for thirds.
    fn probes(left: usize, right: usize) -> (usize, usize) {
        debug_assert!(left <= right);
        let third = (right - left) / 3;
        let (m1, m2) = (left + third, right - third);
        if m1 < m2 {
            return (m1, m2);
        }

        let mid = left + (right - left) / 2;
        (mid.saturating_sub(1).max(left), (mid + 1).min(right))
    }

    /// Searches the configured arity interval for the arity of minimal cost.
    pub fn run<C: CostFunction>(&self, cost: &C) -> Result<SearchReport, SortError> {
        let (mut left, mut right) = (self.config.min_arity, self.config.max_arity);
        if left < 2 || left > right {
            return Err(SortError::InvalidArityRange { left, right });
        }
        let threshold = self.config.threshold.max(MIN_SEARCH_THRESHOLD);

        log::info!("searching optimal arity in [{}, {}]", left, right);

        let mut evaluations = Vec::new();

        while right - left > threshold {
            let (m1, m2) = Self::probes(left, right);

            let (cost_m2, cost_m1) = if self.config.parallel_probes {
                let (m2_result, m1_result) = rayon::join(|| cost.evaluate(m2), || cost.evaluate(m1));
                (m2_result?, m1_result?)
            } else {
                let m2_result = cost.evaluate(m2)?;
                (m2_result, cost.evaluate(m1)?)
            };
            log::info!("arity {}: {} I/Os, arity {}: {} I/Os", m1, cost_m1.io, m2, cost_m2.io);

            if cost_m1.io < cost_m2.io {
                right = m2;
            } else if cost_m2.io < cost_m1.io {
                left = m1;
            } else {
                left = m1;
                right = m2;
            }
            log::info!("search interval narrowed to [{}, {}]", left, right);

            evaluations.push(Evaluation { arity: m2, cost: cost_m2 });
            evaluations.push(Evaluation { arity: m1, cost: cost_m1 });
        }

        log::info!("linear scan of [{}, {}]", left, right);

        for arity in (left..=right).rev() {
            let arity_cost = cost.evaluate(arity)?;
            log::info!("arity {}: {} I/Os", arity, arity_cost.io);
            evaluations.push(Evaluation {
                arity,
                cost: arity_cost,
            });
        }

        let (best_arity, best_cost) = evaluations
            .iter()
            .min_by_key(|evaluation| (evaluation.cost.io, Reverse(evaluation.arity)))
            .map(|evaluation| (evaluation.arity, evaluation.cost.io))
            .ok_or(SortError::InvalidArityRange { left, right })?;

        log::info!("optimal arity found: {} ({} I/Os)", best_arity, best_cost);

        return Ok(SearchReport {
            best_arity,
            best_cost,
            final_interval: (left, right),
            evaluations,
        });
    }
}
