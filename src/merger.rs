//! Block-buffered k-way merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::io;
use std::path::Path;

use log;

use crate::block::BlockStore;
use crate::buffer::RecordBuffer;
use crate::config::SortConfig;
use crate::cost::IoCounter;
use crate::run::Run;

/// Position of the next unconsumed record of one input run.
///
/// Entries are ordered by value first and by source run index second, which makes the merge
/// output deterministic when several runs hold equal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapEntry {
    /// Record value.
    pub value: i64,
    /// Index of the run the record comes from.
    pub source_run: usize,
    /// Index of the first block loaded into the run's buffer.
    pub source_block: u64,
    /// Position of the record in the run's buffer.
    pub offset: usize,
}

impl HeapEntry {
    /// Returns the entry that follows this one within the same loaded buffer, if any.
    pub fn next_in_buffer(&self, buffer: &[i64]) -> Option<HeapEntry> {
        let offset = self.offset + 1;
        buffer.get(offset).map(|&value| HeapEntry { value, offset, ..*self })
    }

    /// Returns the first entry of a buffer freshly loaded from `source_block`, if any.
    pub fn first_in_buffer(source_run: usize, source_block: u64, buffer: &[i64]) -> Option<HeapEntry> {
        buffer.first().map(|&value| HeapEntry {
            value,
            source_run,
            source_block,
            offset: 0,
        })
    }
}

/// Outcome of a single merge.
#[derive(Debug)]
pub struct MergeStats {
    /// Merged run.
    pub output: Run,
    /// Blocks read from the inputs and written to the output.
    pub io: IoCounter,
    /// Number of blocks in each input and output buffer.
    pub blocks_per_share: usize,
}

/// K-way merger bounded by the configured memory budget.
///
/// The budget is split into one buffer per input run plus one output buffer. Input buffers are
/// refilled block-wise as they drain and the output buffer is flushed whenever it fills.
/// Time complexity is *m* \* log(*k*) where *m* is the number of records and *k* the number of runs.
#[derive(Debug, Clone, Copy)]
pub struct KWayMerger {
    config: SortConfig,
    store: BlockStore,
}

impl KWayMerger {
    pub fn new(config: &SortConfig) -> Self {
        KWayMerger {
            config: *config,
            store: BlockStore::new(config.block_size),
        }
    }

    /// Merges up to `arity` sorted runs into a single sorted run written to `output`.
    /// Input run records should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `runs` - Runs to be merged, at most `arity` of them
    /// * `output` - Path of the merged run, truncated if it exists
    /// * `arity` - Maximum fan-in of the merge
    pub fn merge(&self, runs: &[Run], output: &Path, arity: usize) -> io::Result<MergeStats> {
        if runs.len() > arity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot merge {} runs with arity {}", runs.len(), arity),
            ));
        }

        let fan_in = runs.len().min(arity);
        let blocks_per_share = self.config.blocks_per_share(fan_in);
        if !self.config.merge_fits_budget(fan_in) {
            log::warn!(
                "merge of {} runs needs {} bytes of buffers, exceeding memory budget of {} bytes",
                fan_in,
                (fan_in + 1) * blocks_per_share * self.config.block_size,
                self.config.memory_budget
            );
        }

        fs::File::create(output)?;

        let mut io = IoCounter::new();
        let mut buffers: Vec<Vec<i64>> = Vec::with_capacity(fan_in);
        let mut entries = BinaryHeap::with_capacity(fan_in);

        for (idx, run) in runs.iter().enumerate() {
            let buffer = self.store.read_many(run.path(), 0, blocks_per_share)?;
            io.add_reads(self.store.blocks_for(buffer.len()));
            if let Some(entry) = HeapEntry::first_in_buffer(idx, 0, &buffer) {
                entries.push(Reverse(entry));
            }
            buffers.push(buffer);
        }

        let mut out_buf = RecordBuffer::new(blocks_per_share, self.store.records_per_block());
        let mut out_block = 0;
        let mut records = 0;

        while let Some(Reverse(entry)) = entries.pop() {
            out_buf.push(entry.value);
            records += 1;

            if out_buf.is_full() {
                let written = self.store.write_many(output, out_block, out_buf.as_slice())?;
                io.add_writes(written);
                out_block += written;
                out_buf.clear();
            }

            let next = match entry.next_in_buffer(&buffers[entry.source_run]) {
                Some(next) => Some(next),
                None => {
                    let source_block = entry.source_block + blocks_per_share as u64;
                    let run = &runs[entry.source_run];
                    let buffer = self.store.read_many(run.path(), source_block, blocks_per_share)?;
                    io.add_reads(self.store.blocks_for(buffer.len()));
                    let first = HeapEntry::first_in_buffer(entry.source_run, source_block, &buffer);
                    buffers[entry.source_run] = buffer;
                    first
                }
            };

            if let Some(next) = next {
                entries.push(Reverse(next));
            }
        }

        if !out_buf.is_empty() {
            io.add_writes(self.store.write_many(output, out_block, out_buf.as_slice())?);
        }

        log::debug!(
            "merged {} runs into {} ({} records, {} blocks per buffer, {})",
            runs.len(),
            output.display(),
            records,
            blocks_per_share,
            io
        );

        return Ok(MergeStats {
            output: Run::new(output.to_path_buf(), records),
            io,
            blocks_per_share,
        });
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rand::Rng;
    use rstest::*;

    use super::{HeapEntry, KWayMerger};
    use crate::block::BlockStore;
    use crate::config::SortConfig;
    use crate::run::Run;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn write_runs(store: &BlockStore, dir: &tempfile::TempDir, runs: &[Vec<i64>]) -> Vec<Run> {
        runs.iter()
            .enumerate()
            .map(|(idx, records)| {
                let path = dir.path().join(format!("input_{}.bin", idx));
                store.write_many(&path, 0, records).unwrap();
                Run::new(path, records.len() as u64)
            })
            .collect()
    }

    fn read_all(store: &BlockStore, path: &std::path::Path) -> Vec<i64> {
        store.read_many(path, 0, 1 << 20).unwrap()
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![vec![], vec![]], vec![])]
    #[case(vec![vec![3, 5, 9]], vec![3, 5, 9])]
    #[case(
        vec![
            vec![4, 5, 7],
            vec![1, 6],
            vec![3],
            vec![],
        ],
        vec![1, 3, 4, 5, 6, 7],
    )]
    #[case(
        vec![
            vec![-9, -1, 0, 0, 2, 2, 10, 11, 12, 13, 14],
            vec![0, 2, 2, 2],
            vec![-20, 30],
        ],
        vec![-20, -9, -1, 0, 0, 0, 2, 2, 2, 2, 2, 10, 11, 12, 13, 14, 30],
    )]
    fn test_merger(tmp_dir: tempfile::TempDir, #[case] runs: Vec<Vec<i64>>, #[case] expected: Vec<i64>) {
        // 2 records per block, 8 blocks of budget
        let config = SortConfig::new(16, 128);
        let store = BlockStore::new(config.block_size);
        let runs = write_runs(&store, &tmp_dir, &runs);
        let output = tmp_dir.path().join("output.bin");

        let stats = KWayMerger::new(&config).merge(&runs, &output, 4).unwrap();

        assert_eq!(read_all(&store, &output), expected);
        assert_eq!(stats.output.len(), expected.len() as u64);
        assert_eq!(stats.output.path(), output.as_path());
    }

    #[rstest]
    fn test_merger_random(tmp_dir: tempfile::TempDir) {
        let config = SortConfig::new(32, 4 * 32);
        let store = BlockStore::new(config.block_size);
        let mut rng = rand::thread_rng();

        let inputs = Vec::from_iter((0..7).map(|_| {
            let len = rng.gen_range(0..200);
            let mut records = Vec::from_iter((0..len).map(|_| rng.gen_range(-50..50)));
            records.sort();
            records
        }));
        let runs = write_runs(&store, &tmp_dir, &inputs);
        let output = tmp_dir.path().join("output.bin");

        KWayMerger::new(&config).merge(&runs, &output, 7).unwrap();

        let mut expected = Vec::from_iter(inputs.into_iter().flatten());
        expected.sort();
        assert_eq!(read_all(&store, &output), expected);
    }

    #[rstest]
    fn test_merger_cost(tmp_dir: tempfile::TempDir) {
        // 4 records per block, 6 blocks of budget: 2 blocks per share with 2 inputs
        let config = SortConfig::new(32, 6 * 32);
        let store = BlockStore::new(config.block_size);
        let runs = write_runs(
            &store,
            &tmp_dir,
            &[Vec::from_iter((0..20).map(|x| x * 2)), Vec::from_iter((0..9).map(|x| x * 2 + 1))],
        );
        let output = tmp_dir.path().join("output.bin");

        let stats = KWayMerger::new(&config).merge(&runs, &output, 2).unwrap();

        assert_eq!(stats.blocks_per_share, 2);
        // every input block is read once: 5 + 3
        assert_eq!(stats.io.reads(), 8);
        // 29 records span 8 output blocks
        assert_eq!(stats.io.writes(), 8);
        assert_eq!(store.record_count(&output).unwrap(), 29);
    }

    #[rstest]
    fn test_merger_deterministic(tmp_dir: tempfile::TempDir) {
        let config = SortConfig::new(16, 64);
        let store = BlockStore::new(config.block_size);
        let runs = write_runs(&store, &tmp_dir, &[vec![1, 1, 2, 3], vec![1, 2, 2], vec![0, 1, 3, 3, 3]]);

        let first = tmp_dir.path().join("first.bin");
        let second = tmp_dir.path().join("second.bin");
        let first_stats = KWayMerger::new(&config).merge(&runs, &first, 3).unwrap();
        let second_stats = KWayMerger::new(&config).merge(&runs, &second, 3).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        assert_eq!(first_stats.io, second_stats.io);
    }

    #[rstest]
    fn test_merger_rejects_excess_runs(tmp_dir: tempfile::TempDir) {
        let config = SortConfig::new(16, 64);
        let store = BlockStore::new(config.block_size);
        let runs = write_runs(&store, &tmp_dir, &[vec![1], vec![2], vec![3]]);

        let result = KWayMerger::new(&config).merge(&runs, &tmp_dir.path().join("output.bin"), 2);
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
    }

    #[rstest]
    fn test_merger_missing_run(tmp_dir: tempfile::TempDir) {
        let config = SortConfig::new(16, 64);
        let runs = vec![Run::new(tmp_dir.path().join("missing.bin"), 3)];

        assert!(KWayMerger::new(&config)
            .merge(&runs, &tmp_dir.path().join("output.bin"), 2)
            .is_err());
    }

    #[test]
    fn test_heap_entry_order() {
        let low = HeapEntry {
            value: 1,
            source_run: 3,
            source_block: 9,
            offset: 9,
        };
        let tie = HeapEntry {
            value: 1,
            source_run: 4,
            source_block: 0,
            offset: 0,
        };
        assert!(low < tie);

        let buffer = [1, 5];
        let next = low.next_in_buffer(&buffer);
        assert_eq!(next, None);
        let first = HeapEntry::first_in_buffer(2, 6, &buffer).unwrap();
        assert_eq!(
            first.next_in_buffer(&buffer),
            Some(HeapEntry {
                value: 5,
                source_run: 2,
                source_block: 6,
                offset: 1,
            })
        );
    }
}
