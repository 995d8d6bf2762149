//! Block-granular access to flat record files.
//!
//! Record files are concatenated little-endian `i64` values with no header. All disk access goes
//! through [`BlockStore`], which reads and writes whole blocks at block-aligned byte offsets.

use std::fs;
use std::io::{self, prelude::*, SeekFrom};
use std::path::Path;

use crate::config::RECORD_SIZE;

/// Reads and writes fixed-size blocks of record files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStore {
    block_size: usize,
}

impl BlockStore {
    /// Creates a block store. `block_size` must be a positive multiple of the record size.
    pub fn new(block_size: usize) -> Self {
        debug_assert!(block_size > 0 && block_size % RECORD_SIZE == 0);
        BlockStore { block_size }
    }

    pub fn records_per_block(&self) -> usize {
        self.block_size / RECORD_SIZE
    }

    /// Number of blocks spanned by `records` records, counting a partial block as one.
    pub fn blocks_for(&self, records: usize) -> u64 {
        let per_block = self.records_per_block();
        ((records + per_block - 1) / per_block) as u64
    }

    /// Number of records stored in a file, derived from its byte length.
    pub fn record_count(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len() / RECORD_SIZE as u64)
    }

    /// Number of bytes at the end of a file that do not form a whole record.
    pub fn trailing_bytes(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len() % RECORD_SIZE as u64)
    }

    /// Number of blocks in a file, counting a trailing partial block.
    pub fn block_count(&self, path: &Path) -> io::Result<u64> {
        let len = fs::metadata(path)?.len();
        let block_size = self.block_size as u64;
        Ok((len + block_size - 1) / block_size)
    }

    /// Reads the block at `index`. A block truncated by the end of file yields fewer records.
    pub fn read_block(&self, path: &Path, index: u64) -> io::Result<Vec<i64>> {
        self.read_many(path, index, 1)
    }

    /// Reads `count` contiguous blocks starting at `start_index` in one pass.
    /// Stops early at the end of file, so the result may hold fewer blocks than requested.
    pub fn read_many(&self, path: &Path, start_index: u64, count: usize) -> io::Result<Vec<i64>> {
        let mut file = fs::File::open(path)?;
        let offset = start_index * self.block_size as u64;
        let remaining = file.metadata()?.len().saturating_sub(offset);
        file.seek(SeekFrom::Start(offset))?;

        let limit = (count as u64).saturating_mul(self.block_size as u64).min(remaining);
        let mut bytes = Vec::with_capacity(limit as usize);
        file.take(limit).read_to_end(&mut bytes)?;

        return Ok(decode(&bytes));
    }

    /// Writes `records` as the block at `index`, creating the file if absent.
    pub fn write_block(&self, path: &Path, index: u64, records: &[i64]) -> io::Result<()> {
        if records.len() > self.records_per_block() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} records do not fit in a block of {} bytes",
                    records.len(),
                    self.block_size
                ),
            ));
        }
        self.write_many(path, index, records)?;
        return Ok(());
    }

    /// Writes `records` as contiguous blocks starting at `start_index`, creating the file if absent.
    /// The write lands at the exact block offset regardless of the current file length.
    /// Returns the number of blocks written.
    pub fn write_many(&self, path: &Path, start_index: u64, records: &[i64]) -> io::Result<u64> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.seek(SeekFrom::Start(start_index * self.block_size as u64))?;

        let mut writer = io::BufWriter::with_capacity(self.block_size, file);
        writer.write_all(&encode(records))?;
        writer.flush()?;

        return Ok(self.blocks_for(records.len()));
    }
}

fn decode(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; RECORD_SIZE];
            raw.copy_from_slice(chunk);
            i64::from_le_bytes(raw)
        })
        .collect()
}

fn encode(records: &[i64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
    for record in records {
        bytes.extend_from_slice(&record.to_le_bytes());
    }
    bytes
}
