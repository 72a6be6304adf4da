//! # Persistent byte buffers
//!
//! A [`PersistentBuffer`] is a resizable byte array backed by a file,
//! addressed by 64-bit position.  Growing a buffer zero-fills the new region.
//! Every write is asynchronous with respect to stable storage; the only
//! ordering contract consumers may rely on is [`PersistentBuffer::barrier`]:
//! all writes issued before a barrier are durably ordered before all writes
//! issued after it.  Between barriers, implementations may reorder writes
//! arbitrarily.
//!
//! How strictly a buffer honors its barriers is governed by its
//! [`ProtectionLevel`]:
//!
//! - `ReadOnly`: writes and capacity changes fail.
//! - `None`: barriers are no-ops.  Suitable for scratch files.
//! - `Barrier`: barriers establish write ordering, but `force` may be
//!   ignored.
//! - `Force`: `barrier(true)` additionally flushes to physical media before
//!   returning.
//!
//! Four variants are provided:
//!
//! - [`MappedBuffer`]: one contiguous memory mapping, limited to 2^31 − 1
//!   bytes.
//! - [`SegmentedBuffer`]: independent 2^30-byte mappings, for capacities up
//!   to 2^30 × (2^31 − 2) bytes.
//! - [`FileBuffer`]: no mapping; every access is a positioned read or write.
//! - [`TwoCopyBarrierBuffer`]: the crash-safe default, which buffers writes
//!   in memory and commits them with a rename-based atomic swap between two
//!   on-disk copies.
//!
//! All variants hold a whole-file advisory lock from open to close: shared
//! when the buffer is read-only, exclusive otherwise.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

pub(crate) mod lock;

mod file;
mod mapped;
mod segmented;
mod two_copy;

pub use file::FileBuffer;
pub use mapped::{MappedBuffer, MAX_SINGLE_MAPPING};
pub use segmented::{SegmentedBuffer, MAX_SEGMENTED, SEGMENT_SIZE};
pub use two_copy::{commit_all, TwoCopyBarrierBuffer, TwoCopyConfig, TwoCopyConfigBuilder};

#[cfg(test)]
mod tests;

/// Durability policy honored by a buffer's [`barrier`][PersistentBuffer::barrier].
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    /// Writes and capacity changes fail with [`BufferError::ReadOnly`].
    ReadOnly,
    /// Barriers are no-ops.
    None,
    /// Barriers establish write ordering; `force` may be ignored.
    Barrier,
    /// `barrier(true)` flushes to physical media before returning.
    Force,
}

impl Default for ProtectionLevel {
    fn default() -> Self {
        ProtectionLevel::Barrier
    }
}

impl ProtectionLevel {
    /// Whether writes are permitted at this level.
    pub fn is_writable(self) -> bool {
        !matches!(self, ProtectionLevel::ReadOnly)
    }
}

/// Error that occurred during buffer operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BufferError {
    /// A general I/O error occurred.
    #[snafu(display("buffer I/O error: {source}"))]
    Io { source: io::Error },

    /// A write or capacity change was attempted on a read-only buffer.
    #[snafu(display("buffer is read-only"))]
    ReadOnly,

    /// An operation was attempted after `close`.
    #[snafu(display("buffer is closed"))]
    Closed,

    /// A position fell outside the buffer's current capacity.
    #[snafu(display("position {position} is beyond buffer capacity {capacity}"))]
    OutOfBounds { position: u64, capacity: u64 },

    /// A requested capacity exceeds what this buffer variant can address.
    #[snafu(display(
        "requested capacity {requested} exceeds the maximum supported by this buffer ({maximum})"
    ))]
    CapacityExceeded { requested: u64, maximum: u64 },

    /// The whole-file advisory lock is held by another process.
    ///
    /// Advisory locking prevents two handles from being opened on the same
    /// file, but does not prevent other processes from modifying the file in
    /// ways that cause undefined behavior during operation.
    #[snafu(display("failed to lock {}; is another process using this file?", path.display()))]
    LockAlreadyHeld { path: std::path::PathBuf },

    /// The two-copy file set was in a state the commit protocol can never
    /// produce.
    ///
    /// This indicates outside interference with the file set (a copy deleted
    /// or created by hand), not a crash: every crash point of the commit
    /// protocol leaves a recoverable combination of `base`, `base.new`, and
    /// `base.old`.
    #[snafu(display("inconsistent file set for {}: {detail}", path.display()))]
    InconsistentFileSet {
        path: std::path::PathBuf,
        detail: &'static str,
    },
}

impl From<BufferError> for io::Error {
    fn from(e: BufferError) -> io::Error {
        match e {
            BufferError::Io { source } => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Byte-addressable persistent storage with barrier/force durability
/// semantics.
///
/// Positions in `[0, capacity)` are always readable.  After
/// `set_capacity(n)` grows a buffer, every byte in the new region reads
/// zero.  Multi-byte integers are big-endian regardless of host byte order.
pub trait PersistentBuffer {
    /// Gets the durability policy this buffer was opened with.
    fn protection_level(&self) -> ProtectionLevel;

    /// Gets the current capacity, in bytes.
    fn capacity(&self) -> Result<u64, BufferError>;

    /// Grows or shrinks the buffer to `capacity` bytes.
    ///
    /// Growing zero-fills the region `[old_capacity, capacity)`.  Shrinking
    /// discards the tail; a later re-grow reads zeros there as well.
    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError>;

    /// Reads as many bytes as are available at `position` into `buf`,
    /// returning how many were read.
    ///
    /// Returns fewer than `buf.len()` bytes only when `position + buf.len()`
    /// extends past the current capacity; a position at or beyond the
    /// capacity reads zero bytes.
    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError>;

    /// Writes all of `buf` at `position`.
    ///
    /// The write is asynchronous with respect to stable storage; only a
    /// [`barrier`][Self::barrier] constrains when it becomes durable.
    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError>;

    /// Establishes a happens-before boundary on stable storage: every write
    /// issued before this call is durably ordered before every write issued
    /// after it.
    ///
    /// With `force` set, additionally requests a synchronous flush to
    /// physical media.  Both effects are downgraded according to the
    /// buffer's [`ProtectionLevel`].
    fn barrier(&mut self, force: bool) -> Result<(), BufferError>;

    /// Flushes and closes the buffer, releasing its file lock.
    ///
    /// Every later operation fails with [`BufferError::Closed`].  Closing a
    /// closed buffer is a no-op.
    fn close(&mut self) -> Result<(), BufferError>;

    /// Reads exactly `buf.len()` bytes at `position`.
    fn get(&self, position: u64, buf: &mut [u8]) -> Result<(), BufferError> {
        let read = self.get_some(position, buf)?;
        ensure!(
            read == buf.len(),
            OutOfBoundsSnafu {
                position: position + read as u64,
                capacity: self.capacity()?,
            }
        );
        Ok(())
    }

    /// Reads the byte at `position`.
    fn get_byte(&self, position: u64) -> Result<u8, BufferError> {
        let mut buf = [0u8; 1];
        self.get(position, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads the byte at `position` as a boolean (any non-zero value is
    /// `true`).
    fn get_bool(&self, position: u64) -> Result<bool, BufferError> {
        Ok(self.get_byte(position)? != 0)
    }

    /// Reads the big-endian `i32` at `position`.
    fn get_i32(&self, position: u64) -> Result<i32, BufferError> {
        let mut buf = [0u8; 4];
        self.get(position, &mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads the big-endian `i64` at `position`.
    fn get_i64(&self, position: u64) -> Result<i64, BufferError> {
        let mut buf = [0u8; 8];
        self.get(position, &mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Writes a single byte at `position`.
    fn put_byte(&mut self, position: u64, value: u8) -> Result<(), BufferError> {
        self.put(position, &[value])
    }

    /// Writes the big-endian encoding of `value` at `position`.
    fn put_i32(&mut self, position: u64, value: i32) -> Result<(), BufferError> {
        self.put(position, &value.to_be_bytes())
    }

    /// Writes the big-endian encoding of `value` at `position`.
    fn put_i64(&mut self, position: u64, value: i64) -> Result<(), BufferError> {
        self.put(position, &value.to_be_bytes())
    }

    /// Ensures the bytes in `[position, position + len)` are zero.
    ///
    /// Regions that already read zero are not rewritten, so repeated calls
    /// issue no writes to the underlying storage.
    fn ensure_zeros(&mut self, position: u64, len: u64) -> Result<(), BufferError> {
        const CHUNK: usize = 4096;
        static ZEROS: [u8; CHUNK] = [0u8; CHUNK];

        let mut scratch = [0u8; CHUNK];
        let mut pos = position;
        let end = position + len;
        while pos < end {
            let step = usize::try_from((end - pos).min(CHUNK as u64)).expect("step fits in usize");
            self.get(pos, &mut scratch[..step])?;
            if scratch[..step].iter().any(|&b| b != 0) {
                self.put(pos, &ZEROS[..step])?;
            }
            pos += step as u64;
        }
        Ok(())
    }

    /// Creates a bounded read cursor over `[position, position + length)`.
    ///
    /// Reads past the end of the window return zero bytes, which surfaces
    /// from fixed-width decoders as an unexpected-EOF error.
    fn input_stream(&self, position: u64, length: u64) -> BufferInput<'_, Self>
    where
        Self: Sized,
    {
        BufferInput {
            buffer: self,
            position,
            remaining: length,
        }
    }

    /// Creates a bounded write cursor over `[position, position + length)`.
    ///
    /// Writing past the end of the window fails with a write-zero error.
    fn output_stream(&mut self, position: u64, length: u64) -> BufferOutput<'_, Self>
    where
        Self: Sized,
    {
        BufferOutput {
            buffer: self,
            position,
            remaining: length,
        }
    }
}

/// Bounded read cursor over a buffer range.
///
/// See [`PersistentBuffer::input_stream`].
pub struct BufferInput<'a, B: PersistentBuffer> {
    buffer: &'a B,
    position: u64,
    remaining: u64,
}

impl<'a, B: PersistentBuffer> BufferInput<'a, B> {
    /// Bytes left in the window.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<'a, B: PersistentBuffer> io::Read for BufferInput<'a, B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = usize::try_from(self.remaining.min(buf.len() as u64)).expect("bounded by len");
        if want == 0 {
            return Ok(0);
        }
        self.buffer.get(self.position, &mut buf[..want])?;
        self.position += want as u64;
        self.remaining -= want as u64;
        Ok(want)
    }
}

/// Bounded write cursor over a buffer range.
///
/// See [`PersistentBuffer::output_stream`].
pub struct BufferOutput<'a, B: PersistentBuffer> {
    buffer: &'a mut B,
    position: u64,
    remaining: u64,
}

impl<'a, B: PersistentBuffer> BufferOutput<'a, B> {
    /// Bytes left in the window.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<'a, B: PersistentBuffer> io::Write for BufferOutput<'a, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of buffer window",
            ));
        }
        let take = usize::try_from(self.remaining.min(buf.len() as u64)).expect("bounded by len");
        self.buffer.put(self.position, &buf[..take])?;
        self.position += take as u64;
        self.remaining -= take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: PersistentBuffer + ?Sized> PersistentBuffer for Box<B> {
    fn protection_level(&self) -> ProtectionLevel {
        (**self).protection_level()
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        (**self).capacity()
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        (**self).set_capacity(capacity)
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        (**self).get_some(position, buf)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        (**self).put(position, buf)
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        (**self).barrier(force)
    }

    fn close(&mut self) -> Result<(), BufferError> {
        (**self).close()
    }
}

/// Opens the mapping-based buffer variant suited to `maximum_capacity`.
///
/// The hint bounds what the buffer may ever be grown to, not what it starts
/// at: capacities within the single-mapping limit get a [`MappedBuffer`],
/// anything larger gets a [`SegmentedBuffer`].
pub fn open_buffer<P: AsRef<Path>>(
    path: P,
    protection: ProtectionLevel,
    maximum_capacity: u64,
) -> Result<Box<dyn PersistentBuffer>, BufferError> {
    if maximum_capacity <= MAX_SINGLE_MAPPING {
        Ok(Box::new(MappedBuffer::open(path, protection)?))
    } else {
        Ok(Box::new(SegmentedBuffer::open(path, protection)?))
    }
}

/// Rounds `n` up to the next multiple of `page` (a power of two).
pub(crate) fn align_up(n: u64, page: u64) -> u64 {
    debug_assert!(page.is_power_of_two());
    (n + page - 1) & !(page - 1)
}
