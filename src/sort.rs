//! External merge sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use rayon::prelude::*;

use crate::block::BlockStore;
use crate::config::SortConfig;
use crate::cost::IoCounter;
use crate::merger::KWayMerger;
use crate::run::{Run, RunBuilder};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Block size or memory budget is not usable.
    InvalidConfig(String),
    /// Merge arity is less than two.
    InvalidArity(usize),
    /// Arity search interval is empty or contains arities less than two.
    InvalidArityRange { left: usize, right: usize },
    /// Data serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Data deserialization error.
    DeserializationError(rmp_serde::decode::Error),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
            SortError::InvalidConfig(_) | SortError::InvalidArity(_) | SortError::InvalidArityRange { .. } => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            SortError::InvalidArity(arity) => write!(f, "arity must be at least 2, got {}", arity),
            SortError::InvalidArityRange { left, right } => {
                write!(f, "invalid arity range [{}, {}]", left, right)
            }
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
        }
    }
}

/// I/O cost of one merge pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStats {
    /// Pass number starting from 1.
    pub pass: usize,
    /// Number of runs before the pass.
    pub runs_in: usize,
    /// Number of runs after the pass.
    pub runs_out: usize,
    /// Blocks transferred by all merges of the pass.
    pub io: IoCounter,
}

/// I/O cost breakdown of a complete external sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortStats {
    /// Number of initial runs.
    pub runs: usize,
    /// Number of records sorted.
    pub records: u64,
    /// Cost of building the initial runs.
    pub run_generation: IoCounter,
    /// Cost of every merge pass in order.
    pub passes: Vec<PassStats>,
    /// Cost of copying the final run to the output path.
    pub copy: IoCounter,
}

impl SortStats {
    /// Total cost of the sort.
    pub fn total(&self) -> IoCounter {
        self.run_generation + self.passes.iter().map(|pass| pass.io).sum::<IoCounter>() + self.copy
    }

    /// Total number of blocks transferred, the objective of arity tuning.
    pub fn io_operations(&self) -> u64 {
        self.total().total()
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone, Default)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort and merge data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Block size and memory budget.
    config: SortConfig,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(self.threads_number, self.tmp_dir.as_deref(), self.config)
    }

    /// Sets number of threads to be used to sort and merge data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory under which per-sort temporary directories are created.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets block size and memory budget.
    pub fn with_config(mut self, config: SortConfig) -> ExternalSorterBuilder {
        self.config = config;
        return self;
    }

    /// Sets disk block size in bytes.
    pub fn with_block_size(mut self, block_size: usize) -> ExternalSorterBuilder {
        self.config.block_size = block_size;
        return self;
    }

    /// Sets memory budget in bytes.
    pub fn with_memory_budget(mut self, memory_budget: usize) -> ExternalSorterBuilder {
        self.config.memory_budget = memory_budget;
        return self;
    }
}

/// External merge sorter of record files.
pub struct ExternalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory under which per-sort temporary directories are created.
    tmp_dir: Option<Box<Path>>,
    /// Block size and memory budget.
    config: SortConfig,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort and merge data in parallel. If the parameter is
    ///   [`None`] threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If parameter is [`None`] default OS temporary
    ///   directory will be used.
    /// * `config` - Block size and memory budget.
    pub fn new(threads_number: Option<usize>, tmp_path: Option<&Path>, config: SortConfig) -> Result<Self, SortError> {
        config.validate().map_err(SortError::InvalidConfig)?;

        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
            config,
        });
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Directory under which temporary data is stored, if one was configured.
    pub fn tmp_dir(&self) -> Option<&Path> {
        self.tmp_dir.as_deref()
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(&self, arity: usize) -> Result<tempfile::TempDir, SortError> {
        let prefix = format!("merge-{}-", arity);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let tmp_dir = if let Some(tmp_path) = &self.tmp_dir {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::debug!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Sorts the records of `input` into `output` merging at most `arity` runs at once.
    /// Returns the I/O cost breakdown of the sort.
    ///
    /// # Arguments
    /// * `input` - Flat file of records to be sorted
    /// * `output` - Path of the sorted result, truncated if it exists
    /// * `arity` - Maximum number of runs merged together, at least 2
    pub fn sort(&self, input: &Path, output: &Path, arity: usize) -> Result<SortStats, SortError> {
        if arity < 2 {
            return Err(SortError::InvalidArity(arity));
        }

        log::info!("sorting {} into {} (arity: {})", input.display(), output.display(), arity);

        let tmp_dir = self.init_tmp_directory(arity)?;

        let generation = self
            .thread_pool
            .install(|| RunBuilder::new(&self.config).build(input, tmp_dir.path()))
            .map_err(SortError::IO)?;

        let initial_runs = generation.runs.len();
        let records = generation.runs.iter().map(Run::len).sum::<u64>();
        let mut runs = generation.runs;
        let mut passes = Vec::new();

        while runs.len() > 1 {
            let pass = passes.len() + 1;
            let pass_stats = self.merge_pass(&mut runs, tmp_dir.path(), pass, arity)?;
            passes.push(pass_stats);
        }

        let copy = self.deliver(runs.first(), output).map_err(SortError::IO)?;

        tmp_dir.close().map_err(SortError::TempDir)?;

        let stats = SortStats {
            runs: initial_runs,
            records,
            run_generation: generation.io,
            passes,
            copy,
        };
        log::info!(
            "sorted {} records in {} passes with arity {}: {}",
            stats.records,
            stats.passes.len(),
            arity,
            stats.total()
        );

        return Ok(stats);
    }

    /// Merges consecutive groups of at most `arity` runs, replacing `runs` with the merged ones.
    /// Single-run groups are carried forward by renaming.
    fn merge_pass(&self, runs: &mut Vec<Run>, dir: &Path, pass: usize, arity: usize) -> Result<PassStats, SortError> {
        let runs_in = runs.len();
        log::info!("pass {}: merging {} runs with arity {}", pass, runs_in, arity);

        let merger = KWayMerger::new(&self.config);
        let merged: Vec<(Run, IoCounter)> = self
            .thread_pool
            .install(|| {
                runs.par_chunks(arity)
                    .enumerate()
                    .map(|(group, group_runs)| -> io::Result<(Run, IoCounter)> {
                        let path = dir.join(format!("pass_{}_{}.bin", pass, group));
                        if let [run] = group_runs {
                            fs::rename(run.path(), &path)?;
                            return Ok((Run::new(path, run.len()), IoCounter::new()));
                        }

                        let stats = merger.merge(group_runs, &path, arity)?;
                        for run in group_runs {
                            fs::remove_file(run.path())?;
                        }
                        Ok((stats.output, stats.io))
                    })
                    .collect::<io::Result<Vec<_>>>()
            })
            .map_err(SortError::IO)?;

        let io = merged.iter().map(|(_, io)| *io).sum::<IoCounter>();
        *runs = merged.into_iter().map(|(run, _)| run).collect();

        log::info!("pass {}: merged into {} runs ({})", pass, runs.len(), io);

        return Ok(PassStats {
            pass,
            runs_in,
            runs_out: runs.len(),
            io,
        });
    }

    /// Copies the final run to `output` block by block. Without a run an empty output is created.
    fn deliver(&self, run: Option<&Run>, output: &Path) -> io::Result<IoCounter> {
        let mut io = IoCounter::new();
        fs::File::create(output)?;

        let run = match run {
            Some(run) => run,
            None => return Ok(io),
        };

        log::debug!("copying {} to {}", run.path().display(), output.display());

        let store = BlockStore::new(self.config.block_size);
        let blocks_per_copy = self.config.blocks_per_run();
        let full_copy = blocks_per_copy * store.records_per_block();
        let mut block_index = 0;

        loop {
            let records = store.read_many(run.path(), block_index, blocks_per_copy)?;
            if records.is_empty() {
                break;
            }
            io.add_reads(store.blocks_for(records.len()));
            io.add_writes(store.write_many(output, block_index, &records)?);

            if records.len() < full_copy {
                break;
            }
            block_index += blocks_per_copy as u64;
        }

        return Ok(io);
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use rand::Rng;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::block::BlockStore;
    use crate::config::SortConfig;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    // 4 records per block, 2 blocks per run
    fn small_sorter(tmp_dir: &tempfile::TempDir) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_config(SortConfig::new(32, 64))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap()
    }

    fn write_input(path: &Path, block_size: usize, records: &[i64]) {
        BlockStore::new(block_size).write_many(path, 0, records).unwrap();
    }

    fn read_output(path: &Path, block_size: usize) -> Vec<i64> {
        BlockStore::new(block_size).read_many(path, 0, 1 << 20).unwrap()
    }

    fn random_records(len: usize) -> Vec<i64> {
        let mut rng = rand::thread_rng();
        Vec::from_iter((0..len).map(|_| rng.gen::<i64>()))
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(4, 2)]
    #[case(8, 3)]
    #[case(9, 2)]
    #[case(100, 2)]
    #[case(100, 3)]
    #[case(100, 5)]
    #[case(100, 13)]
    #[case(100, 64)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] len: usize, #[case] arity: usize) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");

        let records = random_records(len);
        write_input(&input, 32, &records);

        let stats = sorter.sort(&input, &output, arity).unwrap();

        let mut expected = records.clone();
        expected.sort();
        assert_eq!(read_output(&output, 32), expected);
        assert_eq!(stats.records, len as u64);
        // the input is left untouched
        assert_eq!(read_output(&input, 32), records);
    }

    #[rstest]
    #[case(2, 4)]
    #[case(3, 3)]
    #[case(4, 2)]
    #[case(12, 2)]
    #[case(13, 1)]
    #[case(20, 1)]
    fn test_pass_count(tmp_dir: tempfile::TempDir, #[case] arity: usize, #[case] expected_passes: usize) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");

        // 13 initial runs
        write_input(&input, 32, &Vec::from_iter((0..100).rev()));

        let stats = sorter.sort(&input, &output, arity).unwrap();

        assert_eq!(stats.runs, 13);
        assert_eq!(stats.passes.len(), expected_passes);
        assert_eq!(stats.passes.last().unwrap().runs_out, 1);
        assert!(stats.passes.windows(2).all(|pair| pair[0].runs_out == pair[1].runs_in));
        assert!(stats.passes.iter().all(|pass| pass.runs_out < pass.runs_in));
        assert_eq!(read_output(&output, 32), Vec::from_iter(0..100));
    }

    #[rstest]
    fn test_sort_cost(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");

        write_input(&input, 32, &[9, 8, 7, 6, 5, 4, 3, 2, 1]);

        let stats = sorter.sort(&input, &output, 2).unwrap();

        assert_eq!(stats.run_generation.reads(), 3);
        assert_eq!(stats.run_generation.writes(), 3);
        assert_eq!(stats.passes.len(), 1);
        assert_eq!(stats.passes[0].io.reads(), 3);
        assert_eq!(stats.passes[0].io.writes(), 3);
        assert_eq!(stats.copy.reads(), 3);
        assert_eq!(stats.copy.writes(), 3);
        assert_eq!(stats.io_operations(), 18);
    }

    #[rstest]
    fn test_sort_cost_deterministic(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        write_input(&input, 32, &random_records(333));

        let first = sorter.sort(&input, &tmp_dir.path().join("first.bin"), 3).unwrap();
        let second = sorter.sort(&input, &tmp_dir.path().join("second.bin"), 3).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            fs::read(tmp_dir.path().join("first.bin")).unwrap(),
            fs::read(tmp_dir.path().join("second.bin")).unwrap()
        );
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");
        write_input(&input, 32, &[]);

        let stats = sorter.sort(&input, &output, 4).unwrap();

        assert_eq!(stats.runs, 0);
        assert!(stats.passes.is_empty());
        assert_eq!(stats.io_operations(), 0);
        assert_eq!(fs::metadata(&output).unwrap().len(), 0);
    }

    #[rstest]
    fn test_temporary_files_removed(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");
        write_input(&input, 32, &random_records(77));

        sorter.sort(&input, &output, 2).unwrap();

        let mut entries = Vec::from_iter(fs::read_dir(tmp_dir.path()).unwrap().map(|entry| entry.unwrap().file_name()));
        entries.sort();
        assert_eq!(entries, vec!["input.bin", "output.bin"]);
    }

    #[rstest]
    fn test_invalid_arity(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let input = tmp_dir.path().join("input.bin");
        write_input(&input, 32, &[1, 2, 3]);

        let result = sorter.sort(&input, &tmp_dir.path().join("output.bin"), 1);
        assert!(matches!(result, Err(SortError::InvalidArity(1))));
    }

    #[rstest]
    fn test_missing_input(tmp_dir: tempfile::TempDir) {
        let sorter = small_sorter(&tmp_dir);
        let result = sorter.sort(
            &tmp_dir.path().join("missing.bin"),
            &tmp_dir.path().join("output.bin"),
            2,
        );
        assert!(matches!(result, Err(SortError::IO(_))));
    }

    #[test]
    fn test_invalid_config() {
        let result = ExternalSorterBuilder::new().with_block_size(12).build();
        assert!(matches!(result, Err(SortError::InvalidConfig(_))));
    }

    #[rstest]
    fn test_reference_scenario(tmp_dir: tempfile::TempDir) {
        let sorter = ExternalSorterBuilder::new()
            .with_memory_budget(4 * 4096)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let input = tmp_dir.path().join("input.bin");
        let output = tmp_dir.path().join("output.bin");
        write_input(&input, 4096, &random_records(10_000));

        let stats = sorter.sort(&input, &output, 4).unwrap();

        let sorted = read_output(&output, 4096);
        assert_eq!(sorted.len(), 10_000);
        assert!(sorted.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(stats.runs, 5);
        assert_eq!(stats.passes.len(), 2);
    }
}
