//! I/O cost accounting.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Counts block transfers attributable to one operation.
///
/// Every block read or written counts one unit. Seeks are not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounter {
    reads: u64,
    writes: u64,
}

impl IoCounter {
    pub fn new() -> Self {
        IoCounter::default()
    }

    pub fn add_reads(&mut self, blocks: u64) {
        self.reads += blocks;
    }

    pub fn add_writes(&mut self, blocks: u64) {
        self.writes += blocks;
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Total number of blocks transferred.
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

impl Add for IoCounter {
    type Output = IoCounter;

    fn add(self, other: IoCounter) -> IoCounter {
        IoCounter {
            reads: self.reads + other.reads,
            writes: self.writes + other.writes,
        }
    }
}

impl AddAssign for IoCounter {
    fn add_assign(&mut self, other: IoCounter) {
        *self = *self + other;
    }
}

impl Sum for IoCounter {
    fn sum<I: Iterator<Item = IoCounter>>(iter: I) -> Self {
        iter.fold(IoCounter::default(), Add::add)
    }
}

impl fmt::Display for IoCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} I/Os ({} reads, {} writes)", self.total(), self.reads, self.writes)
    }
}
