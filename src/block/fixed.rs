//! Fixed-size block allocator.
//!
//! Every block is a `block_size`-byte slot, tracked by an allocation bitmap
//! where bit `i` (least-significant bit first within each byte) marks slot
//! `i` allocated.  Two layouts exist, chosen by the block size:
//!
//! - **Interleaved** (`block_size` < 2^30): the file is a repeating group of
//!   one `block_size`-byte bitmap followed by the `8 × block_size` slots its
//!   bits index.
//! - **Single** (`block_size` ≥ 2^30): one bitmap at offset 0, sized
//!   `max(1, 2^(64−1−lz(block_size)−3))` bytes, followed by all slots.
//!
//! Ids are slot indices; slot addresses are pure arithmetic over the two
//! constants.  Freshly exposed file regions read zero, so their bitmap
//! bytes mark every slot free without any initialization pass.

use std::collections::BTreeSet;

use snafu::{ensure, ResultExt};

use crate::buffer::{align_up, PersistentBuffer};

use super::{BlockError, BufferSnafu, PersistentBlockBuffer};

const PAGE: u64 = 4096;
const SINGLE_BITMAP_THRESHOLD: u64 = 1 << 30;

/// A [`PersistentBlockBuffer`] with equal-size slots over an allocation
/// bitmap.
#[derive(Debug)]
pub struct FixedBlockBuffer<B: PersistentBuffer> {
    buffer: B,
    block_size: u64,
    /// Bitmap size in bytes: the whole bitmap in single mode, one group's
    /// bitmap in interleaved mode (where it equals `block_size`).
    bitmap_size: u64,
    single_bitmap: bool,
    /// Monotonic scan cursor: no free slot exists below it other than those
    /// in `known_free`.
    lowest_free_id: u64,
    /// Slots freed by deallocation, all below or around the cursor.
    known_free: BTreeSet<u64>,
}

impl<B: PersistentBuffer> FixedBlockBuffer<B> {
    /// Opens a fixed allocator with `block_size`-byte slots over `buffer`.
    ///
    /// The allocation state lives entirely in the bitmap, so reopening an
    /// existing file needs no scan; the cursor starts at slot 0 and skips
    /// allocated slots as it goes.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn open(buffer: B, block_size: u64) -> Result<FixedBlockBuffer<B>, BlockError> {
        assert!(block_size > 0, "block size must be non-zero");
        let single_bitmap = block_size >= SINGLE_BITMAP_THRESHOLD;
        let bitmap_size = if single_bitmap {
            1u64.max(1u64 << (64 - 1 - block_size.leading_zeros() - 3))
        } else {
            block_size
        };
        Ok(FixedBlockBuffer {
            buffer,
            block_size,
            bitmap_size,
            single_bitmap,
            lowest_free_id: 0,
            known_free: BTreeSet::new(),
        })
    }

    /// Size, in bytes, of every block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Consumes the allocator and returns the underlying buffer.
    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Byte address of the bitmap byte holding `id`'s bit.
    fn bitmap_byte_address(&self, id: u64) -> u64 {
        if self.single_bitmap {
            id / 8
        } else {
            let per_group = self.block_size * 8;
            let group = id / per_group;
            let slot = id % per_group;
            group * self.group_size() + slot / 8
        }
    }

    /// Bit position of `id` within its bitmap byte (LSB first).
    fn bit(&self, id: u64) -> u32 {
        if self.single_bitmap {
            (id % 8) as u32
        } else {
            ((id % (self.block_size * 8)) % 8) as u32
        }
    }

    /// Byte address of `id`'s slot data.
    fn slot_address(&self, id: u64) -> u64 {
        if self.single_bitmap {
            self.bitmap_size + id * self.block_size
        } else {
            let per_group = self.block_size * 8;
            let group = id / per_group;
            let slot = id % per_group;
            group * self.group_size() + self.block_size + slot * self.block_size
        }
    }

    /// Bytes spanned by one interleaved bitmap-plus-slots group.
    fn group_size(&self) -> u64 {
        // One bitmap byte per 8 slots: block_size bytes of bitmap index
        // 8 * block_size slots.
        self.block_size + self.block_size * 8 * self.block_size
    }

    fn is_set(&self, id: u64) -> Result<bool, BlockError> {
        let byte = self
            .buffer
            .get_byte(self.bitmap_byte_address(id))
            .context(BufferSnafu)?;
        Ok(byte & (1 << self.bit(id)) != 0)
    }

    /// Grows the file so that `id`'s bitmap byte and slot both fit,
    /// rounded up to a 4 KiB boundary.
    fn ensure_slot_exists(&mut self, id: u64) -> Result<(), BlockError> {
        let needed = (self.slot_address(id) + self.block_size)
            .max(self.bitmap_byte_address(id) + 1);
        let capacity = self.buffer.capacity().context(BufferSnafu)?;
        if needed > capacity {
            let new_capacity = align_up(needed, PAGE);
            trace!(
                old_capacity = capacity,
                new_capacity,
                "Extending fixed block buffer."
            );
            self.buffer.set_capacity(new_capacity).context(BufferSnafu)?;
        }
        Ok(())
    }

    /// Advances the scan cursor to the next free slot, extending the file
    /// when every existing bit is set.
    fn scan_free(&mut self) -> Result<u64, BlockError> {
        let mut id = self.lowest_free_id;
        loop {
            let byte_address = self.bitmap_byte_address(id);
            let capacity = self.buffer.capacity().context(BufferSnafu)?;
            if byte_address >= capacity {
                // Past every existing bitmap byte: grow; the zero-filled
                // bitmap marks the new slots free.
                self.ensure_slot_exists(id)?;
                return Ok(id);
            }
            let byte = self.buffer.get_byte(byte_address).context(BufferSnafu)?;
            if byte == 0xFF {
                id += 8 - u64::from(self.bit(id));
                continue;
            }
            let mut bit = self.bit(id);
            while byte & (1 << bit) != 0 {
                bit += 1;
                id += 1;
            }
            return Ok(id);
        }
    }

    fn set_bit(&mut self, id: u64, allocated: bool) -> Result<(), BlockError> {
        let byte_address = self.bitmap_byte_address(id);
        let byte = self.buffer.get_byte(byte_address).context(BufferSnafu)?;
        let mask = 1 << self.bit(id);
        let updated = if allocated { byte | mask } else { byte & !mask };
        self.buffer
            .put_byte(byte_address, updated)
            .context(BufferSnafu)
    }

    fn check_access(&self, id: u64, offset: u64, len: u64) -> Result<u64, BlockError> {
        let end = offset + len;
        ensure!(
            end <= self.block_size,
            super::OutOfBlockBoundsSnafu {
                id,
                end,
                capacity: self.block_size,
            }
        );
        ensure!(self.is_set(id)?, super::NotAllocatedSnafu { id });
        Ok(self.slot_address(id) + offset)
    }
}

impl<B: PersistentBuffer> PersistentBlockBuffer for FixedBlockBuffer<B> {
    type IdIter<'a> = FixedIdIter<'a, B> where Self: 'a;

    fn allocate(&mut self, minimum_size: u64) -> Result<u64, BlockError> {
        ensure!(
            minimum_size <= self.block_size,
            super::BlockTooLargeSnafu {
                requested: minimum_size,
                maximum: self.block_size,
            }
        );
        let id = match self.known_free.pop_first() {
            Some(id) => id,
            None => {
                let id = self.scan_free()?;
                self.lowest_free_id = id + 1;
                id
            }
        };
        self.ensure_slot_exists(id)?;
        self.set_bit(id, true)?;
        Ok(id)
    }

    fn deallocate(&mut self, id: u64) -> Result<(), BlockError> {
        let allocated = self.is_set(id)?;
        assert!(allocated, "block {id} is already deallocated");
        self.set_bit(id, false)?;
        self.known_free.insert(id);
        Ok(())
    }

    fn block_capacity(&self, id: u64) -> Result<u64, BlockError> {
        ensure!(self.is_set(id)?, super::NotAllocatedSnafu { id });
        Ok(self.block_size)
    }

    fn get(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let address = self.check_access(id, offset, buf.len() as u64)?;
        self.buffer.get(address, buf).context(BufferSnafu)
    }

    fn put(&mut self, id: u64, offset: u64, buf: &[u8]) -> Result<(), BlockError> {
        let address = self.check_access(id, offset, buf.len() as u64)?;
        self.buffer.put(address, buf).context(BufferSnafu)
    }

    fn iterate_block_ids(&self) -> FixedIdIter<'_, B> {
        FixedIdIter {
            blocks: self,
            next_id: 0,
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

/// Ascending cursor over the allocation bitmap.
pub struct FixedIdIter<'a, B: PersistentBuffer> {
    blocks: &'a FixedBlockBuffer<B>,
    next_id: u64,
}

impl<'a, B: PersistentBuffer> Iterator for FixedIdIter<'a, B> {
    type Item = Result<u64, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = match self.blocks.buffer.capacity().context(BufferSnafu) {
            Ok(capacity) => capacity,
            Err(e) => return Some(Err(e)),
        };
        loop {
            let id = self.next_id;
            let byte_address = self.blocks.bitmap_byte_address(id);
            if byte_address >= capacity
                || self.blocks.slot_address(id) + self.blocks.block_size > capacity
            {
                return None;
            }
            let byte = match self.blocks.buffer.get_byte(byte_address).context(BufferSnafu) {
                Ok(byte) => byte,
                Err(e) => return Some(Err(e)),
            };
            if byte == 0 {
                // Skip the whole all-free byte.
                self.next_id = id + 8 - u64::from(self.blocks.bit(id));
                continue;
            }
            if byte & (1 << self.blocks.bit(id)) != 0 {
                self.next_id = id + 1;
                return Some(Ok(id));
            }
            self.next_id = id + 1;
        }
    }
}
