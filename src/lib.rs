//! `arity-sort` sorts files of 64-bit integers that do not fit in memory and finds the merge arity that
//! minimizes disk I/O.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. During the first phase the input is split into
//! memory-sized chunks that are sorted and saved as runs, during the following passes the runs are merged at most
//! *arity* at a time until a single sorted run remains. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `arity-sort` supports the following features:
//!
//! * **Block I/O accounting:**
//!   every block read or written is counted, giving the exact I/O cost of a sort.
//! * **Memory budget:**
//!   run size and merge buffers are derived from a configured memory budget and block size.
//! * **Multithreading support:**
//!   runs are sorted and independent merge groups are merged in parallel.
//! * **Arity tuning:**
//!   the merge arity with the lowest I/O cost is searched with ternary probes followed by a linear scan.
//!
//! # Example
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//!
//! use arity_sort::{AritySearch, ExternalSorterBuilder, SearchConfig, SortCostOracle};
//!
//! fn main() {
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_memory_budget(50 * 1024 * 1024)
//!         .with_tmp_dir(Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort(Path::new("input.bin"), Path::new("output.bin"), 62).unwrap();
//!     println!("sorted with {} I/Os", stats.io_operations());
//!
//!     let oracle = SortCostOracle::new(sorter, vec![PathBuf::from("input.bin")]).unwrap();
//!     let report = AritySearch::new(SearchConfig::new(2, 512)).run(&oracle).unwrap();
//!     println!("best arity: {}", report.best_arity);
//! }
//! ```

pub mod arity;
pub mod block;
pub mod buffer;
pub mod config;
pub mod cost;
pub mod merger;
pub mod report;
pub mod run;
pub mod sort;

pub use arity::{ArityCost, AritySearch, CostFunction, CostTable, Evaluation, SearchReport, SortCostOracle};
pub use block::BlockStore;
pub use buffer::RecordBuffer;
pub use config::{SearchConfig, SortConfig};
pub use cost::IoCounter;
pub use merger::{HeapEntry, KWayMerger, MergeStats};
pub use run::{Run, RunBuilder, RunGeneration};
pub use sort::{ExternalSorter, ExternalSorterBuilder, PassStats, SortError, SortStats};
