use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::io::{Read, Seek, SeekFrom, Write};

use log::trace;

/// Default number of blocks held by a `BlockCache`.
pub const DEFAULT_CACHE_BLOCKS: usize = 0x2000;

/// A read-ahead cache over a contiguous range of partition blocks.
///
/// Block numbers are relative to the start of the selected partition.
/// The cache never extends past the end of the partition, requests near the end
/// are moved back so the whole buffer stays inside.
pub struct BlockCache {
    buf: Box<[u8]>,
    block_size: usize,
    capacity: usize,
    partition_offset: u64,
    partition_blocks: u64,
    first_block: Option<u64>,
    count: usize,
}

impl BlockCache {
    /// Creates a cache for a partition holding `partition_blocks` blocks starting at byte `partition_offset`.
    ///
    /// The capacity is limited to the number of blocks in the partition.
    pub fn new(
        block_size: usize,
        configured_blocks: usize,
        partition_offset: u64,
        partition_blocks: u64,
    ) -> Result<Self> {
        if block_size == 0 || configured_blocks == 0 || partition_blocks == 0 {
            return Err(Error(ErrorOrigin::Cache, ErrorKind::InvalidBuffer));
        }

        let capacity = if (configured_blocks as u64) < partition_blocks {
            configured_blocks
        } else {
            partition_blocks as usize
        };

        let len = capacity
            .checked_mul(block_size)
            .ok_or(Error(ErrorOrigin::Cache, ErrorKind::Overflow))?;

        Ok(Self {
            buf: vec![0u8; len].into_boxed_slice(),
            block_size,
            capacity,
            partition_offset,
            partition_blocks,
            first_block: None,
            count: 0,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Capacity in blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Returns the first cached block and the number of cached blocks.
    pub fn range(&self) -> Option<(u64, usize)> {
        self.first_block.map(|first| (first, self.count))
    }

    /// The block the next read-ahead would start at.
    pub fn next_block(&self) -> Option<u64> {
        self.first_block.map(|first| first + self.count as u64)
    }

    pub fn invalidate(&mut self) {
        self.first_block = None;
        self.count = 0;
    }

    /// Checks whether blocks `[block, block + blocks)` can be served from the cache.
    ///
    /// The cache has to be filled, lie inside the partition and hold all requested blocks.
    pub fn is_valid(&self, block: u64, blocks: usize) -> bool {
        match self.range() {
            Some((first, count)) => {
                !self.buf.is_empty()
                    && count <= self.capacity
                    && first + count as u64 <= self.partition_blocks
                    && block >= first
                    && block + blocks as u64 <= first + count as u64
            }
            None => false,
        }
    }

    /// Fills the cache starting at `block`.
    ///
    /// The start is clamped to `partition_blocks - capacity` so the cache remains in the partition.
    pub fn fill<T: Read + Seek>(&mut self, handle: &mut T, block: u64) -> Result<()> {
        let max_first = self.partition_blocks - self.capacity as u64;
        let first = std::cmp::min(block, max_first);
        let offset = self.partition_offset + first * self.block_size as u64;

        trace!(
            "filling block cache: first={:x} count={:x} offset={:x}",
            first,
            self.capacity,
            offset
        );

        self.invalidate();
        handle.seek(SeekFrom::Start(offset)).map_err(|err| {
            Error(ErrorOrigin::Cache, ErrorKind::UnableToSeekFile)
                .log_error(format!("offset={:x}: {}", offset, err))
        })?;
        handle.read_exact(&mut self.buf).map_err(|err| {
            Error(ErrorOrigin::Cache, ErrorKind::UnableToReadFile).log_error(format!(
                "offset={:x} len={:x}: {}",
                offset,
                self.buf.len(),
                err
            ))
        })?;

        self.first_block = Some(first);
        self.count = self.capacity;
        Ok(())
    }

    /// Makes sure blocks `[block, block + blocks)` are cached, refilling if necessary.
    pub fn ensure<T: Read + Seek>(&mut self, handle: &mut T, block: u64, blocks: usize) -> Result<()> {
        if blocks > self.capacity {
            return Err(Error(ErrorOrigin::Cache, ErrorKind::CacheInvalid));
        }
        if !self.is_valid(block, blocks) {
            self.fill(handle, block)?;
        }
        if self.is_valid(block, blocks) {
            Ok(())
        } else {
            Err(Error(ErrorOrigin::Cache, ErrorKind::CacheInvalid))
        }
    }

    fn byte_range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let first = self
            .first_block
            .ok_or(Error(ErrorOrigin::Cache, ErrorKind::CacheInvalid))?;
        let base = first * self.block_size as u64;
        if offset < base || offset + len as u64 > base + (self.count * self.block_size) as u64 {
            return Err(Error(ErrorOrigin::Cache, ErrorKind::CacheInvalid));
        }
        let start = (offset - base) as usize;
        Ok(start..start + len)
    }

    /// Copies cached bytes at partition relative `offset` into `out`.
    pub fn copy_out(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.byte_range(offset, out.len())?;
        out.copy_from_slice(&self.buf[range]);
        Ok(())
    }

    /// Updates cached bytes at partition relative `offset`.
    pub fn copy_in(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.byte_range(offset, data.len())?;
        self.buf[range].copy_from_slice(data);
        Ok(())
    }

    /// Writes the cached blocks `[block, block + blocks)` back to the medium.
    pub fn flush<T: Write + Seek>(&self, handle: &mut T, block: u64, blocks: usize) -> Result<()> {
        if !self.is_valid(block, blocks) {
            return Err(Error(ErrorOrigin::Cache, ErrorKind::CacheInvalid));
        }

        let range = self.byte_range(block * self.block_size as u64, blocks * self.block_size)?;
        let offset = self.partition_offset + block * self.block_size as u64;

        handle.seek(SeekFrom::Start(offset)).map_err(|err| {
            Error(ErrorOrigin::Cache, ErrorKind::UnableToSeekFile)
                .log_error(format!("offset={:x}: {}", offset, err))
        })?;
        handle.write_all(&self.buf[range]).map_err(|err| {
            Error(ErrorOrigin::Cache, ErrorKind::UnableToWriteFile).log_error(format!(
                "offset={:x} blocks={:x}: {}",
                offset, blocks, err
            ))
        })
    }
}
