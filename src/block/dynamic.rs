//! Buddy allocator with power-of-two blocks.
//!
//! Every block occupies `2^k` bytes including a one-byte header at its
//! start: bits 0–5 carry the size class `k`, bit 6 is reserved zero, bit 7
//! is the allocated flag.  Blocks are aligned to their own size and ids are
//! starting byte offsets, so the payload of block `id` lives at
//! `[id + 1, id + 2^k)`.
//!
//! The free-space map — one ordered set of starting addresses per size
//! class — is rebuilt at open by a single linear header scan.  The scan
//! coalesces leftward only, which keeps it correct before it has seen the
//! blocks to the right, and it extends a file truncated mid-grow so the
//! capacity ends on a block boundary again.  A zero-filled tail region
//! reads as one-byte free blocks that the same coalescing folds back into
//! large blocks, so interrupted growth needs no repair step.
//!
//! Splitting writes the right child's header, issues one barrier, then
//! rewrites the parent's header: recovery sees either an intact parent or
//! two intact children, never a half-split.  Coalescing on deallocate walks
//! buddies upward (`buddy = id ^ 2^k`) and writes only the final promoted
//! header; absorbed headers become unreachable payload bytes.  Class 63 is
//! the ceiling: nothing coalesces past it, and the address space is capped
//! at `2^63 − 1` bytes.

use std::collections::BTreeSet;

use snafu::{ensure, ResultExt};

use crate::buffer::{align_up, PersistentBuffer};

use super::{BlockError, BufferSnafu, PersistentBlockBuffer};

const PAGE: u64 = 4096;
const SIZE_CLASS_MASK: u8 = 0x3F;
const ALLOCATED_FLAG: u8 = 0x80;
const MAX_CLASS: u32 = 63;
/// Largest byte address the allocator will place a block under.
const MAX_ADDRESS_SPACE: u64 = (1 << MAX_CLASS) - 1;
/// Grow by at least a quarter of the prior capacity.
const GROWTH_DIVISOR: u64 = 4;

/// A [`PersistentBlockBuffer`] allocating power-of-two sized blocks with
/// buddy split and merge.
#[derive(Debug)]
pub struct DynamicBlockBuffer<B: PersistentBuffer> {
    buffer: B,
    /// Free-block starting addresses, indexed by size class.
    free_map: Vec<BTreeSet<u64>>,
}

impl<B: PersistentBuffer> DynamicBlockBuffer<B> {
    /// Opens a buddy allocator over `buffer`, rebuilding the free-space map
    /// with one linear scan of the block headers.
    pub fn open(mut buffer: B) -> Result<DynamicBlockBuffer<B>, BlockError> {
        let mut free_map = vec![BTreeSet::new(); MAX_CLASS as usize + 1];
        let mut capacity = buffer.capacity().context(BufferSnafu)?;
        let mut position = 0;
        while position < capacity {
            let header = buffer.get_byte(position).context(BufferSnafu)?;
            let class = u32::from(header & SIZE_CLASS_MASK);
            let size = 1u64 << class;
            if position + size > capacity {
                // Truncated mid-grow: extend so the file ends on a block
                // boundary again.  The new bytes read zero and join the
                // free map as one-byte blocks below.
                capacity = position + size;
                debug!(capacity, "Extending file truncated during growth.");
                buffer.set_capacity(capacity).context(BufferSnafu)?;
            }
            if header & ALLOCATED_FLAG == 0 {
                Self::insert_free_leftward(&mut free_map, position, class);
            }
            position += size;
        }
        Ok(DynamicBlockBuffer { buffer, free_map })
    }

    /// Consumes the allocator and returns the underlying buffer.
    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Inserts a free block into the map, merging only with buddies to the
    /// left.  Used by the open-time scan, which has not yet visited blocks
    /// to the right.
    fn insert_free_leftward(free_map: &mut [BTreeSet<u64>], mut position: u64, mut class: u32) {
        while class < MAX_CLASS {
            let size = 1u64 << class;
            // A block whose class-bit is set is the right half of its
            // parent; its buddy sits to the left.
            if position & size == 0 {
                break;
            }
            let buddy = position - size;
            if !free_map[class as usize].remove(&buddy) {
                break;
            }
            position = buddy;
            class += 1;
        }
        free_map[class as usize].insert(position);
    }

    /// Inserts a free block, merging with free buddies on either side while
    /// the promoted block stays within `capacity`, then writes the one
    /// promoted header.
    fn coalesce_insert(
        &mut self,
        mut position: u64,
        mut class: u32,
        capacity: u64,
    ) -> Result<(), BlockError> {
        while class < MAX_CLASS {
            let size = 1u64 << class;
            let buddy = position ^ size;
            let parent = position & !size;
            if parent + (size << 1) > capacity {
                break;
            }
            if !self.free_map[class as usize].remove(&buddy) {
                break;
            }
            position = parent;
            class += 1;
        }
        self.buffer
            .put_byte(position, class as u8)
            .context(BufferSnafu)?;
        self.free_map[class as usize].insert(position);
        Ok(())
    }

    /// Allocates a block of exactly class `class`, splitting larger free
    /// blocks or growing the file as needed.
    fn allocate_class(&mut self, class: u32) -> Result<u64, BlockError> {
        if let Some(&id) = self.free_map[class as usize].iter().next() {
            self.free_map[class as usize].remove(&id);
            self.buffer
                .put_byte(id, ALLOCATED_FLAG | class as u8)
                .context(BufferSnafu)?;
            return Ok(id);
        }

        let larger_available = (class as usize + 1..=MAX_CLASS as usize)
            .any(|larger| !self.free_map[larger].is_empty());
        if larger_available {
            let parent = self.allocate_class(class + 1)?;
            let size = 1u64 << class;
            let right = parent + size;
            // Right child first, then one barrier, then the parent's new
            // header: recovery sees either the whole parent or both halves.
            self.buffer.put_byte(right, class as u8).context(BufferSnafu)?;
            self.buffer.barrier(false).context(BufferSnafu)?;
            self.buffer
                .put_byte(parent, ALLOCATED_FLAG | class as u8)
                .context(BufferSnafu)?;
            self.free_map[class as usize].insert(right);
            return Ok(parent);
        }

        self.extend_for(class)
    }

    /// Grows the file to fit one new block of class `class`, populating the
    /// padding before it and the surplus after it as free blocks.
    fn extend_for(&mut self, class: u32) -> Result<u64, BlockError> {
        let size = 1u64 << class;
        let old_capacity = self.buffer.capacity().context(BufferSnafu)?;
        let block_start = align_up(old_capacity, size);
        ensure!(
            block_start <= MAX_ADDRESS_SPACE - size,
            super::BlockTooLargeSnafu {
                requested: size,
                maximum: MAX_ADDRESS_SPACE - block_start,
            }
        );
        let grown = old_capacity + old_capacity / GROWTH_DIVISOR;
        let new_capacity = align_up(grown.max(block_start + size), PAGE);
        trace!(
            old_capacity,
            new_capacity,
            class,
            "Extending dynamic block buffer."
        );
        self.buffer
            .set_capacity(new_capacity)
            .context(BufferSnafu)?;

        self.populate_free_region(old_capacity, block_start, new_capacity)?;
        self.buffer
            .put_byte(block_start, ALLOCATED_FLAG | class as u8)
            .context(BufferSnafu)?;
        self.populate_free_region(block_start + size, new_capacity, new_capacity)?;
        Ok(block_start)
    }

    /// Fills `[start, end)` with the largest aligned power-of-two free
    /// blocks that fit, writing their headers and entering them in the map.
    fn populate_free_region(
        &mut self,
        start: u64,
        end: u64,
        capacity: u64,
    ) -> Result<(), BlockError> {
        let mut position = start;
        while position < end {
            let align_limit = if position == 0 {
                MAX_CLASS
            } else {
                position.trailing_zeros().min(MAX_CLASS)
            };
            let fit_limit = 63 - (end - position).leading_zeros();
            let class = align_limit.min(fit_limit);
            self.coalesce_insert(position, class, capacity)?;
            position += 1u64 << class;
        }
        Ok(())
    }

    /// Every free block as `(address, size class)`, for invariant checks.
    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(u64, u32)> {
        self.free_map
            .iter()
            .enumerate()
            .flat_map(|(class, set)| {
                set.iter().map(move |&address| (address, class as u32))
            })
            .collect()
    }

    /// Reads and validates the header of an allocated block.
    fn allocated_header(&self, id: u64) -> Result<u32, BlockError> {
        let header = self.buffer.get_byte(id).context(BufferSnafu)?;
        ensure!(
            header & ALLOCATED_FLAG != 0,
            super::NotAllocatedSnafu { id }
        );
        Ok(u32::from(header & SIZE_CLASS_MASK))
    }
}

impl<B: PersistentBuffer> PersistentBlockBuffer for DynamicBlockBuffer<B> {
    type IdIter<'a> = DynamicIdIter<'a, B> where Self: 'a;

    fn allocate(&mut self, minimum_size: u64) -> Result<u64, BlockError> {
        // Smallest class whose payload (2^k − 1, excluding the header byte)
        // holds minimum_size.
        let class = 64 - minimum_size.leading_zeros();
        ensure!(
            class <= MAX_CLASS,
            super::BlockTooLargeSnafu {
                requested: minimum_size,
                maximum: MAX_ADDRESS_SPACE,
            }
        );
        self.allocate_class(class)
    }

    fn deallocate(&mut self, id: u64) -> Result<(), BlockError> {
        let header = self.buffer.get_byte(id).context(BufferSnafu)?;
        assert!(
            header & ALLOCATED_FLAG != 0,
            "block {id} is already deallocated"
        );
        let class = u32::from(header & SIZE_CLASS_MASK);
        assert!(
            id % (1u64 << class) == 0,
            "block id {id} is not aligned to its size class {class}"
        );
        let capacity = self.buffer.capacity().context(BufferSnafu)?;
        self.coalesce_insert(id, class, capacity)
    }

    fn block_capacity(&self, id: u64) -> Result<u64, BlockError> {
        let class = self.allocated_header(id)?;
        Ok((1u64 << class) - 1)
    }

    fn get(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let class = self.allocated_header(id)?;
        let payload = (1u64 << class) - 1;
        let end = offset + buf.len() as u64;
        ensure!(
            end <= payload,
            super::OutOfBlockBoundsSnafu {
                id,
                end,
                capacity: payload,
            }
        );
        self.buffer.get(id + 1 + offset, buf).context(BufferSnafu)
    }

    fn put(&mut self, id: u64, offset: u64, buf: &[u8]) -> Result<(), BlockError> {
        let class = self.allocated_header(id)?;
        let payload = (1u64 << class) - 1;
        let end = offset + buf.len() as u64;
        ensure!(
            end <= payload,
            super::OutOfBlockBoundsSnafu {
                id,
                end,
                capacity: payload,
            }
        );
        self.buffer.put(id + 1 + offset, buf).context(BufferSnafu)
    }

    fn iterate_block_ids(&self) -> DynamicIdIter<'_, B> {
        DynamicIdIter {
            blocks: self,
            position: 0,
        }
    }

    fn barrier(&mut self, force: bool) -> Result<(), BlockError> {
        self.buffer.barrier(force).context(BufferSnafu)
    }

    fn capacity(&self) -> Result<u64, BlockError> {
        self.buffer.capacity().context(BufferSnafu)
    }

    fn close(&mut self) -> Result<(), BlockError> {
        self.buffer.close().context(BufferSnafu)
    }
}

/// Linear forward header scan yielding allocated block ids.
pub struct DynamicIdIter<'a, B: PersistentBuffer> {
    blocks: &'a DynamicBlockBuffer<B>,
    position: u64,
}

impl<'a, B: PersistentBuffer> Iterator for DynamicIdIter<'a, B> {
    type Item = Result<u64, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = match self.blocks.buffer.capacity().context(BufferSnafu) {
            Ok(capacity) => capacity,
            Err(e) => return Some(Err(e)),
        };
        while self.position < capacity {
            let id = self.position;
            let header = match self.blocks.buffer.get_byte(id).context(BufferSnafu) {
                Ok(header) => header,
                Err(e) => return Some(Err(e)),
            };
            let size = 1u64 << u32::from(header & SIZE_CLASS_MASK);
            if id + size > capacity {
                return None;
            }
            self.position = id + size;
            if header & ALLOCATED_FLAG != 0 {
                return Some(Ok(id));
            }
        }
        None
    }
}
