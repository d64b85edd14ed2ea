//! Block ring
//!
//! A fixed set of identically sized blocks backed by one file. Blocks
//! never move; their age is their epoch, assigned when they last became a
//! write target. Rank by epoch determines the partition: the newest
//! blocks accept writes, the middle band is read-only warm, the oldest
//! band is read-only and refreshable. Rotation recycles the block with
//! the lowest epoch, which kills every index entry referencing it.

use crate::blobstore::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Age class of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    New,
    Current,
    Old,
}

#[derive(Clone, Copy)]
struct BlockState {
    epoch: u64,
    write_offset_bytes: u64,
}

pub struct BlockList {
    file: Arc<File>,
    block_size_bytes: u64,
    old_blocks: usize,
    current_blocks: usize,
    new_blocks: usize,
    states: Vec<BlockState>,
    next_epoch: u64,
}

impl BlockList {
    pub fn new(
        path: &Path,
        block_size_bytes: u64,
        old_blocks: usize,
        current_blocks: usize,
        new_blocks: usize,
    ) -> StorageResult<Self> {
        let total = old_blocks + current_blocks + new_blocks;
        if total == 0 || block_size_bytes == 0 {
            return Err(StorageError::InvalidArgument(
                "block ring needs at least one block of non-zero size".to_string(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(total as u64 * block_size_bytes)?;

        // Initial epochs 1..=total; the highest ranks are the write
        // targets.
        let states = (0..total)
            .map(|i| BlockState {
                epoch: i as u64 + 1,
                write_offset_bytes: 0,
            })
            .collect();
        Ok(Self {
            file: Arc::new(file),
            block_size_bytes,
            old_blocks,
            current_blocks,
            new_blocks,
            states,
            next_epoch: total as u64 + 1,
        })
    }

    pub fn block_count(&self) -> usize {
        self.states.len()
    }

    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }

    /// Shared handle for lock-free content reads.
    pub fn file_handle(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Absolute file offset of a position within a block.
    pub fn byte_offset(&self, block_index: usize, offset_bytes: u64) -> u64 {
        block_index as u64 * self.block_size_bytes + offset_bytes
    }

    /// The smallest epoch still attached to a block. Index entries below
    /// it reference recycled blocks and are dead.
    pub fn min_live_epoch(&self) -> u64 {
        self.states.iter().map(|s| s.epoch).min().unwrap_or(1)
    }

    pub fn epoch_of(&self, block_index: usize) -> u64 {
        self.states[block_index].epoch
    }

    pub fn partition_of(&self, block_index: usize) -> Partition {
        let epoch = self.states[block_index].epoch;
        let newer = self.states.iter().filter(|s| s.epoch > epoch).count();
        if newer < self.new_blocks {
            Partition::New
        } else if newer < self.new_blocks + self.current_blocks {
            Partition::Current
        } else {
            Partition::Old
        }
    }

    /// Indices of the new-partition blocks, newest first.
    fn new_block_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.states.len()).collect();
        indices.sort_by(|a, b| self.states[*b].epoch.cmp(&self.states[*a].epoch));
        indices.truncate(self.new_blocks);
        indices
    }

    /// Recycle the oldest block as a fresh write target.
    fn rotate(&mut self) -> usize {
        let oldest = self
            .states
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.epoch)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.states[oldest] = BlockState {
            epoch: self.next_epoch,
            write_offset_bytes: 0,
        };
        self.next_epoch += 1;
        log::debug!(
            "rotated block {} to epoch {}",
            oldest,
            self.states[oldest].epoch
        );
        oldest
    }

    /// Reserve `size_bytes` in a new-partition block. The write target is
    /// drawn with geometrically decreasing weights, newest first; a full
    /// pick triggers rotation and the fresh block takes the allocation.
    pub fn allocate(&mut self, size_bytes: u64) -> StorageResult<(usize, u64, u64)> {
        if size_bytes > self.block_size_bytes {
            return Err(StorageError::ResourceExhausted(format!(
                "blob of {} bytes exceeds the block size of {} bytes",
                size_bytes, self.block_size_bytes
            )));
        }
        let candidates = self.new_block_indices();
        let chosen = candidates[pick_geometric(candidates.len())];
        let state = self.states[chosen];
        if state.write_offset_bytes + size_bytes <= self.block_size_bytes {
            let offset = state.write_offset_bytes;
            self.states[chosen].write_offset_bytes += size_bytes;
            return Ok((chosen, offset, state.epoch));
        }
        let fresh = self.rotate();
        self.states[fresh].write_offset_bytes = size_bytes;
        Ok((fresh, 0, self.states[fresh].epoch))
    }

    /// Write blob bytes into a reserved region.
    pub fn write(&self, block_index: usize, offset_bytes: u64, data: &[u8]) -> io::Result<()> {
        self.file
            .write_all_at(data, self.byte_offset(block_index, offset_bytes))
    }

    /// Read a whole region into memory. Used by the refresh copy.
    pub fn read(&self, block_index: usize, offset_bytes: u64, size_bytes: u64) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; size_bytes as usize];
        self.file
            .read_exact_at(&mut data, self.byte_offset(block_index, offset_bytes))?;
        Ok(data)
    }
}

/// Draw an index with weights ½, ¼, … scaled to sum to one.
fn pick_geometric(count: usize) -> usize {
    if count <= 1 {
        return 0;
    }
    let total = 1.0 - 0.5f64.powi(count as i32);
    let mut draw = rand::random::<f64>() * total;
    for i in 0..count {
        let weight = 0.5f64.powi(i as i32 + 1);
        if draw < weight {
            return i;
        }
        draw -= weight;
    }
    count - 1
}
