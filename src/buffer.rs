//! Block-sized record buffers.

use rayon;

/// Record buffer limited by a whole number of blocks.
///
/// Used both to accumulate an initial run before sorting and as the output buffer of a merge.
pub struct RecordBuffer {
    limit: usize,
    inner: Vec<i64>,
}

impl RecordBuffer {
    /// Creates an empty buffer holding at most `blocks` blocks of `records_per_block` records.
    pub fn new(blocks: usize, records_per_block: usize) -> Self {
        let limit = blocks * records_per_block;
        RecordBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }

    /// Wraps already loaded records into a buffer of `blocks` blocks without copying them.
    pub fn with_records(blocks: usize, records_per_block: usize, records: Vec<i64>) -> Self {
        RecordBuffer {
            limit: blocks * records_per_block,
            inner: records,
        }
    }

    /// Adds a new record to the buffer.
    pub fn push(&mut self, record: i64) {
        self.inner.push(record);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    pub fn as_slice(&self) -> &[i64] {
        self.inner.as_slice()
    }

    /// Empties the buffer keeping its allocation.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl rayon::slice::ParallelSliceMut<i64> for RecordBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [i64] {
        self.inner.as_mut_slice()
    }
}

#[cfg(test)]
mod test {
    use rayon::slice::ParallelSliceMut;

    use super::RecordBuffer;

    #[test]
    fn test_record_buffer() {
        let mut buffer = RecordBuffer::new(1, 2);

        buffer.push(3);
        assert_eq!(buffer.is_full(), false);
        buffer.push(1);
        assert_eq!(buffer.is_full(), true);

        buffer.par_sort_unstable();
        assert_eq!(buffer.as_slice(), &[1, 3]);

        buffer.clear();
        assert!(buffer.is_empty());

        buffer.push(7);
        buffer.push(8);
        assert_eq!(buffer.as_slice(), &[7, 8]);
        assert_eq!(buffer.is_full(), true);

        let wrapped = RecordBuffer::with_records(2, 2, vec![4, 2, 9]);
        assert_eq!(wrapped.len(), 3);
        assert_eq!(wrapped.is_full(), false);
    }
}
