//! Segmented-mapping buffer.
//!
//! Splits the address space into 2^30-byte segments, each independently
//! memory-mapped, lifting the 2^31 − 1 limit of the single mapping to
//! 2^30 × (2^31 − 2) bytes.  Accesses that straddle a segment boundary are
//! reassembled byte-wise; multi-byte integer reads therefore work at any
//! position, not just segment-aligned ones.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use snafu::{ensure, ResultExt};

use super::{lock, BufferError, IoSnafu, PersistentBuffer, ProtectionLevel};

const SEGMENT_SHIFT: u32 = 30;
/// Size of one mapped segment.
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;
/// Largest capacity the segmented buffer supports.
pub const MAX_SEGMENTED: u64 = SEGMENT_SIZE * ((1 << 31) - 2);

#[derive(Debug)]
enum Segment {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Segment {
    fn bytes(&self) -> &[u8] {
        match self {
            Segment::ReadOnly(map) => map,
            Segment::ReadWrite(map) => map,
        }
    }
}

/// A [`PersistentBuffer`] built from independent 2^30-byte mappings.
#[derive(Debug)]
pub struct SegmentedBuffer {
    file: Option<File>,
    path: PathBuf,
    protection: ProtectionLevel,
    capacity: u64,
    segments: Vec<Segment>,
}

impl SegmentedBuffer {
    /// Opens (creating if writable and absent) the file at `path` and maps
    /// it segment by segment.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or mapped, if it exceeds the
    /// addressable maximum, or if another process holds a conflicting
    /// advisory lock on it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        protection: ProtectionLevel,
    ) -> Result<SegmentedBuffer, BufferError> {
        let path = path.as_ref().to_path_buf();
        let writable = protection.is_writable();
        let file = File::options()
            .read(true)
            .write(writable)
            .create(writable)
            .open(&path)
            .context(IoSnafu)?;
        lock::lock_handle(&file, &path, !writable)?;
        let capacity = file.metadata().context(IoSnafu)?.len();
        ensure!(
            capacity <= MAX_SEGMENTED,
            super::CapacityExceededSnafu {
                requested: capacity,
                maximum: MAX_SEGMENTED,
            }
        );
        let segments = Self::map_segments(&file, capacity, writable)?;
        Ok(SegmentedBuffer {
            file: Some(file),
            path,
            protection,
            capacity,
            segments,
        })
    }

    /// Path this buffer was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_segments(
        file: &File,
        capacity: u64,
        writable: bool,
    ) -> Result<Vec<Segment>, BufferError> {
        let count = usize::try_from((capacity + SEGMENT_SIZE - 1) >> SEGMENT_SHIFT)
            .expect("bounded by MAX_SEGMENTED");
        let mut segments = Vec::with_capacity(count);
        for index in 0..count {
            let offset = (index as u64) << SEGMENT_SHIFT;
            let len = usize::try_from((capacity - offset).min(SEGMENT_SIZE))
                .expect("bounded by SEGMENT_SIZE");
            let segment = if writable {
                Segment::ReadWrite(
                    unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file) }
                        .context(IoSnafu)?,
                )
            } else {
                Segment::ReadOnly(
                    unsafe { MmapOptions::new().offset(offset).len(len).map(file) }
                        .context(IoSnafu)?,
                )
            };
            segments.push(segment);
        }
        Ok(segments)
    }

    fn file(&self) -> Result<&File, BufferError> {
        self.file.as_ref().ok_or(BufferError::Closed)
    }

    fn flush_segments(&self) -> Result<(), BufferError> {
        for segment in &self.segments {
            if let Segment::ReadWrite(map) = segment {
                map.flush().context(IoSnafu)?;
            }
        }
        Ok(())
    }
}

impl PersistentBuffer for SegmentedBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        self.file()?;
        Ok(self.capacity)
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        ensure!(self.protection.is_writable(), super::ReadOnlySnafu);
        ensure!(
            capacity <= MAX_SEGMENTED,
            super::CapacityExceededSnafu {
                requested: capacity,
                maximum: MAX_SEGMENTED,
            }
        );
        let file = self.file.as_ref().ok_or(BufferError::Closed)?;
        self.segments.clear();
        file.set_len(capacity).context(IoSnafu)?;
        self.segments = Self::map_segments(file, capacity, true)?;
        self.capacity = capacity;
        Ok(())
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        self.file()?;
        if position >= self.capacity {
            return Ok(0);
        }
        let available =
            usize::try_from((self.capacity - position).min(buf.len() as u64)).expect("fits usize");
        let mut copied = 0;
        while copied < available {
            let pos = position + copied as u64;
            let segment = &self.segments[usize::try_from(pos >> SEGMENT_SHIFT).expect("segment")];
            let within = usize::try_from(pos & (SEGMENT_SIZE - 1)).expect("within segment");
            let step = (available - copied).min(segment.bytes().len() - within);
            buf[copied..copied + step].copy_from_slice(&segment.bytes()[within..within + step]);
            copied += step;
        }
        Ok(available)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        self.file()?;
        ensure!(self.protection.is_writable(), super::ReadOnlySnafu);
        let end = position + buf.len() as u64;
        ensure!(
            end <= self.capacity,
            super::OutOfBoundsSnafu {
                position: end,
                capacity: self.capacity,
            }
        );
        let mut copied = 0;
        while copied < buf.len() {
            let pos = position + copied as u64;
            let segment =
                &mut self.segments[usize::try_from(pos >> SEGMENT_SHIFT).expect("segment")];
            let within = usize::try_from(pos & (SEGMENT_SIZE - 1)).expect("within segment");
            match segment {
                Segment::ReadWrite(map) => {
                    let step = (buf.len() - copied).min(map.len() - within);
                    map[within..within + step].copy_from_slice(&buf[copied..copied + step]);
                    copied += step;
                }
                Segment::ReadOnly(_) => unreachable!("writable segment missing"),
            }
        }
        Ok(())
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        let file = self.file()?;
        match self.protection {
            ProtectionLevel::ReadOnly | ProtectionLevel::None => Ok(()),
            ProtectionLevel::Barrier => self.flush_segments(),
            ProtectionLevel::Force => {
                self.flush_segments()?;
                if force {
                    file.sync_all().context(IoSnafu)?;
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<(), BufferError> {
        if self.file.is_some() {
            if self.protection.is_writable() {
                self.flush_segments()?;
            }
            self.segments.clear();
            let file = self.file.take().expect("checked above");
            if self.protection.is_writable() {
                file.sync_all().context(IoSnafu)?;
            }
        }
        Ok(())
    }
}

impl Drop for SegmentedBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!(%error, path = %self.path.display(), "Failed to close segmented buffer.");
        }
    }
}
