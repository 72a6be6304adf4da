//! # Persistent block buffers
//!
//! A block buffer carves a [`PersistentBuffer`] into id-addressed blocks.
//! Ids are unique and non-negative for the lifetime of the block; the first
//! block ever allocated has id 0 and serves as a stable anchor for metadata.
//! Iteration over live blocks is in ascending id order, so the anchor comes
//! first.
//!
//! Two allocators are provided:
//!
//! - [`FixedBlockBuffer`]: equal-size slots tracked by an allocation bitmap.
//!   Ids are slot indices.
//! - [`DynamicBlockBuffer`]: power-of-two sized blocks with buddy
//!   split/merge.  Ids are the blocks' starting byte offsets.
//!
//! Barriers pass straight through to the underlying buffer; allocator
//! metadata is designed so that a crash between any two barriers leaves a
//! state the open-time scan reconstructs without repair.

use snafu::Snafu;

use crate::buffer::BufferError;

mod dynamic;
mod fixed;

pub use dynamic::DynamicBlockBuffer;
pub use fixed::FixedBlockBuffer;

#[cfg(test)]
mod tests;

/// Error that occurred during block buffer operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BlockError {
    /// The underlying buffer failed.
    #[snafu(display("block buffer I/O error: {source}"))]
    Buffer { source: BufferError },

    /// The block at `id` is not currently allocated.
    #[snafu(display("block {id} is not allocated"))]
    NotAllocated { id: u64 },

    /// A block-relative access fell outside the block's payload.
    #[snafu(display(
        "offset {end} is beyond the capacity {capacity} of block {id}"
    ))]
    OutOfBlockBounds { id: u64, end: u64, capacity: u64 },

    /// A requested block size exceeds what this allocator can provide.
    #[snafu(display("requested block size {requested} exceeds the maximum ({maximum})"))]
    BlockTooLarge { requested: u64, maximum: u64 },
}

/// Allocatable blocks over a persistent buffer.
///
/// Deallocating a block that is not allocated, like passing an id that was
/// never returned by [`allocate`][Self::allocate], is a programmer error and
/// panics; all recoverable failures surface as [`BlockError`].
pub trait PersistentBlockBuffer {
    /// Iterator over live block ids, ascending.
    type IdIter<'a>: Iterator<Item = Result<u64, BlockError>>
    where
        Self: 'a;

    /// Allocates a block whose payload holds at least `minimum_size` bytes,
    /// returning its id.
    fn allocate(&mut self, minimum_size: u64) -> Result<u64, BlockError>;

    /// Releases the block at `id`; its storage may be reclaimed or merged
    /// with neighbors immediately.
    ///
    /// # Panics
    ///
    /// Panics if the block is already deallocated.
    fn deallocate(&mut self, id: u64) -> Result<(), BlockError>;

    /// Payload capacity, in bytes, of the block at `id`.
    fn block_capacity(&self, id: u64) -> Result<u64, BlockError>;

    /// Reads `buf.len()` payload bytes starting `offset` bytes into the
    /// block at `id`.
    fn get(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf` starting `offset` bytes into the block at `id`.
    fn put(&mut self, id: u64, offset: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// Yields every live block id exactly once, in ascending order.
    ///
    /// The iterator borrows the buffer, so allocation and deallocation
    /// during iteration are rejected at compile time.
    fn iterate_block_ids(&self) -> Self::IdIter<'_>;

    /// Forwards a write-ordering barrier to the underlying buffer.
    fn barrier(&mut self, force: bool) -> Result<(), BlockError>;

    /// Capacity, in bytes, of the underlying buffer.
    fn capacity(&self) -> Result<u64, BlockError>;

    /// Flushes and closes the underlying buffer.
    fn close(&mut self) -> Result<(), BlockError>;

    /// Reads the big-endian `i64` at `offset` within the block at `id`.
    fn get_i64(&self, id: u64, offset: u64) -> Result<i64, BlockError> {
        let mut buf = [0u8; 8];
        self.get(id, offset, &mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Writes the big-endian encoding of `value` at `offset` within the
    /// block at `id`.
    fn put_i64(&mut self, id: u64, offset: u64, value: i64) -> Result<(), BlockError> {
        self.put(id, offset, &value.to_be_bytes())
    }
}
