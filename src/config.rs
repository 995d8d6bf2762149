//! Sorting and arity search configuration.

use serde::{Deserialize, Serialize};

/// Size of a single record in bytes.
pub const RECORD_SIZE: usize = std::mem::size_of::<i64>();

/// Default disk block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default memory budget in bytes (50 MiB).
pub const DEFAULT_MEMORY_BUDGET: usize = 50 * 1024 * 1024;

/// Smallest narrowing threshold that still guarantees the search interval shrinks.
pub const MIN_SEARCH_THRESHOLD: usize = 2;

/// Block size and memory budget shared by every sorting component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortConfig {
    /// Disk block size in bytes. Must be a positive multiple of [`RECORD_SIZE`].
    pub block_size: usize,
    /// Total memory available for record buffers in bytes.
    pub memory_budget: usize,
}

impl SortConfig {
    pub fn new(block_size: usize, memory_budget: usize) -> Self {
        SortConfig {
            block_size,
            memory_budget,
        }
    }

    /// Checks the configuration, returning a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 || self.block_size % RECORD_SIZE != 0 {
            return Err(format!(
                "block size must be a positive multiple of {} bytes, got {}",
                RECORD_SIZE, self.block_size
            ));
        }
        if self.memory_budget == 0 {
            return Err("memory budget must be positive".to_string());
        }
        return Ok(());
    }

    /// Number of records that fit in one block.
    pub fn records_per_block(&self) -> usize {
        self.block_size / RECORD_SIZE
    }

    /// Number of blocks sorted in memory to build one initial run.
    pub fn blocks_per_run(&self) -> usize {
        (self.memory_budget / self.block_size).max(1)
    }

    /// Number of blocks in each buffer of a merge with `fan_in` inputs.
    ///
    /// The budget is split into `fan_in + 1` shares (one per input plus the output buffer),
    /// each rounded down to whole blocks with a floor of one block.
    pub fn blocks_per_share(&self, fan_in: usize) -> usize {
        (self.memory_budget / (fan_in + 1) / self.block_size).max(1)
    }

    /// Checks whether a merge with `fan_in` inputs stays within the memory budget.
    pub fn merge_fits_budget(&self, fan_in: usize) -> bool {
        (fan_in + 1) * self.blocks_per_share(fan_in) * self.block_size <= self.memory_budget
    }
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            memory_budget: DEFAULT_MEMORY_BUDGET,
        }
    }
}

/// Arity search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Lower bound of the arity interval (inclusive).
    pub min_arity: usize,
    /// Upper bound of the arity interval (inclusive).
    pub max_arity: usize,
    /// Interval width at which narrowing stops and the linear scan starts.
    pub threshold: usize,
    /// Evaluate both narrowing probes concurrently.
    pub parallel_probes: bool,
}

impl SearchConfig {
    pub fn new(min_arity: usize, max_arity: usize) -> Self {
        SearchConfig {
            min_arity,
            max_arity,
            ..SearchConfig::default()
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            min_arity: 2,
            max_arity: 512,
            threshold: 4,
            parallel_probes: false,
        }
    }
}
