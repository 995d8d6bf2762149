//! Initial run generation.
//!
//! Streams the input file in memory-budget-sized strides, sorts each stride in place and persists
//! it as one sorted run file.

use std::io;
use std::path::{Path, PathBuf};

use log;
use rayon::slice::ParallelSliceMut;

use crate::block::BlockStore;
use crate::buffer::RecordBuffer;
use crate::config::SortConfig;
use crate::cost::IoCounter;

/// A file of records sorted in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    path: PathBuf,
    records: u64,
}

impl Run {
    pub fn new(path: PathBuf, records: u64) -> Self {
        Run { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Result of the run generation phase.
#[derive(Debug)]
pub struct RunGeneration {
    /// Sorted runs in input order.
    pub runs: Vec<Run>,
    /// Blocks read from the input and written to the runs.
    pub io: IoCounter,
}

/// Builds sorted initial runs out of an unsorted input file.
#[derive(Debug, Clone, Copy)]
pub struct RunBuilder {
    store: BlockStore,
    blocks_per_run: usize,
}

impl RunBuilder {
    pub fn new(config: &SortConfig) -> Self {
        RunBuilder {
            store: BlockStore::new(config.block_size),
            blocks_per_run: config.blocks_per_run(),
        }
    }

    /// Splits `input` into sorted runs stored in `dir`.
    /// An empty input yields no runs.
    pub fn build(&self, input: &Path, dir: &Path) -> io::Result<RunGeneration> {
        let records_per_block = self.store.records_per_block();

        log::debug!(
            "building runs from {} ({} blocks, {} blocks per run)",
            input.display(),
            self.store.block_count(input)?,
            self.blocks_per_run
        );

        let trailing = self.store.trailing_bytes(input)?;
        if trailing != 0 {
            log::warn!(
                "{} ends with {} bytes that do not form a whole record, ignoring them",
                input.display(),
                trailing
            );
        }

        let mut runs = Vec::new();
        let mut io = IoCounter::new();
        let mut block_index = 0;

        loop {
            let records = self.store.read_many(input, block_index, self.blocks_per_run)?;
            if records.is_empty() {
                break;
            }
            io.add_reads(self.store.blocks_for(records.len()));

            let mut buffer = RecordBuffer::with_records(self.blocks_per_run, records_per_block, records);
            buffer.par_sort_unstable();

            let path = dir.join(format!("run_{}.bin", runs.len()));
            io.add_writes(self.store.write_many(&path, 0, buffer.as_slice())?);

            log::debug!("run {} saved ({} records)", path.display(), buffer.len());
            runs.push(Run::new(path, buffer.len() as u64));

            if !buffer.is_full() {
                break;
            }
            block_index += self.blocks_per_run as u64;
        }

        log::info!("generated {} runs ({})", runs.len(), io);

        return Ok(RunGeneration { runs, io });
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Write;

    use rand::Rng;
    use rstest::*;

    use super::RunBuilder;
    use crate::block::BlockStore;
    use crate::config::SortConfig;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    // 4 records per block, 2 blocks per run
    fn small_config() -> SortConfig {
        SortConfig::new(32, 64)
    }

    #[rstest]
    #[case(0, 0, 0, 0)]
    #[case(1, 1, 1, 1)]
    #[case(4, 1, 1, 1)]
    #[case(8, 1, 2, 2)]
    #[case(9, 2, 3, 3)]
    #[case(100, 13, 25, 25)]
    fn test_run_counts(
        tmp_dir: tempfile::TempDir,
        #[case] records: i64,
        #[case] expected_runs: usize,
        #[case] expected_reads: u64,
        #[case] expected_writes: u64,
    ) {
        let config = small_config();
        let store = BlockStore::new(config.block_size);
        let input = tmp_dir.path().join("input.bin");
        store.write_many(&input, 0, &Vec::from_iter((0..records).rev())).unwrap();

        let generation = RunBuilder::new(&config).build(&input, tmp_dir.path()).unwrap();

        assert_eq!(generation.runs.len(), expected_runs);
        assert_eq!(generation.io.reads(), expected_reads);
        assert_eq!(generation.io.writes(), expected_writes);
        assert_eq!(generation.runs.iter().map(|run| run.len()).sum::<u64>(), records as u64);
    }

    #[rstest]
    fn test_trailing_bytes_ignored(tmp_dir: tempfile::TempDir) {
        let config = small_config();
        let store = BlockStore::new(config.block_size);
        let input = tmp_dir.path().join("input.bin");
        store.write_many(&input, 0, &[9, 3, 7, 1, 5]).unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(&input).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let generation = RunBuilder::new(&config).build(&input, tmp_dir.path()).unwrap();

        assert_eq!(generation.runs.len(), 1);
        assert_eq!(generation.io.reads(), 2);
        assert_eq!(store.read_many(generation.runs[0].path(), 0, 2).unwrap(), vec![1, 3, 5, 7, 9]);
    }

    #[rstest]
    fn test_runs_sorted(tmp_dir: tempfile::TempDir) {
        let config = small_config();
        let store = BlockStore::new(config.block_size);
        let input = tmp_dir.path().join("input.bin");

        let mut rng = rand::thread_rng();
        let data = Vec::from_iter((0..50).map(|_| rng.gen::<i64>()));
        store.write_many(&input, 0, &data).unwrap();

        let generation = RunBuilder::new(&config).build(&input, tmp_dir.path()).unwrap();

        let mut restored = Vec::new();
        for (idx, run) in generation.runs.iter().enumerate() {
            let records = store.read_many(run.path(), 0, 1024).unwrap();
            assert!(records.windows(2).all(|pair| pair[0] <= pair[1]));
            assert_eq!(records.len() as u64, run.len());
            assert_eq!(records, {
                let mut expected = data[idx * 8..(idx * 8 + 8).min(data.len())].to_vec();
                expected.sort();
                expected
            });
            restored.extend(records);
        }
        assert_eq!(restored.len(), data.len());
    }
}
