//! Single-mapping buffer.
//!
//! Maps the whole file `[0, capacity)` into one contiguous region.  Limited
//! to 2^31 − 1 bytes; [`SegmentedBuffer`][super::SegmentedBuffer] lifts the
//! limit.  `set_capacity` truncates or extends the file and re-maps.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use snafu::{ensure, ResultExt};

use super::{lock, BufferError, IoSnafu, PersistentBuffer, ProtectionLevel};

/// Largest capacity a single contiguous mapping supports.
pub const MAX_SINGLE_MAPPING: u64 = i32::MAX as u64;

#[derive(Debug)]
enum Map {
    /// Zero-capacity buffers carry no mapping at all.
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A [`PersistentBuffer`] backed by one contiguous memory mapping.
#[derive(Debug)]
pub struct MappedBuffer {
    file: Option<File>,
    path: PathBuf,
    protection: ProtectionLevel,
    capacity: u64,
    map: Map,
}

impl MappedBuffer {
    /// Opens (creating if writable and absent) the file at `path` and maps
    /// it.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or mapped, if it exceeds the
    /// single-mapping limit, or if another process holds a conflicting
    /// advisory lock on it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        protection: ProtectionLevel,
    ) -> Result<MappedBuffer, BufferError> {
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
            capacity <= MAX_SINGLE_MAPPING,
            super::CapacityExceededSnafu {
                requested: capacity,
                maximum: MAX_SINGLE_MAPPING,
            }
        );
        let map = Self::map_region(&file, capacity, writable)?;
        Ok(MappedBuffer {
            file: Some(file),
            path,
            protection,
            capacity,
            map,
        })
    }

    /// Path this buffer was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_region(file: &File, capacity: u64, writable: bool) -> Result<Map, BufferError> {
        if capacity == 0 {
            return Ok(Map::Empty);
        }
        let len = usize::try_from(capacity).expect("bounded by MAX_SINGLE_MAPPING");
        let map = if writable {
            Map::ReadWrite(unsafe { MmapOptions::new().len(len).map_mut(file) }.context(IoSnafu)?)
        } else {
            Map::ReadOnly(unsafe { MmapOptions::new().len(len).map(file) }.context(IoSnafu)?)
        };
        Ok(map)
    }

    fn file(&self) -> Result<&File, BufferError> {
        self.file.as_ref().ok_or(BufferError::Closed)
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            Map::Empty => &[],
            Map::ReadOnly(map) => map,
            Map::ReadWrite(map) => map,
        }
    }

    fn flush_map(&self) -> Result<(), BufferError> {
        if let Map::ReadWrite(map) = &self.map {
            map.flush().context(IoSnafu)?;
        }
        Ok(())
    }
}

impl PersistentBuffer for MappedBuffer {
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
            capacity <= MAX_SINGLE_MAPPING,
            super::CapacityExceededSnafu {
                requested: capacity,
                maximum: MAX_SINGLE_MAPPING,
            }
        );
        let file = self.file.as_ref().ok_or(BufferError::Closed)?;
        // Unmap before truncating: shrinking a live mapping is undefined on
        // several platforms.
        self.map = Map::Empty;
        file.set_len(capacity).context(IoSnafu)?;
        self.map = Self::map_region(file, capacity, true)?;
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
        let start = usize::try_from(position).expect("bounded by MAX_SINGLE_MAPPING");
        buf[..available].copy_from_slice(&self.bytes()[start..start + available]);
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
        match &mut self.map {
            Map::ReadWrite(map) => {
                let start = usize::try_from(position).expect("bounded by MAX_SINGLE_MAPPING");
                map[start..start + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            // put with a non-writable or empty map is unreachable past the
            // bounds checks above.
            Map::Empty | Map::ReadOnly(_) => unreachable!("writable map missing"),
        }
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        let file = self.file()?;
        match self.protection {
            ProtectionLevel::ReadOnly | ProtectionLevel::None => Ok(()),
            ProtectionLevel::Barrier => self.flush_map(),
            ProtectionLevel::Force => {
                self.flush_map()?;
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
                self.flush_map()?;
            }
            self.map = Map::Empty;
            let file = self.file.take().expect("checked above");
            if self.protection.is_writable() {
                file.sync_all().context(IoSnafu)?;
            }
        }
        Ok(())
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!(%error, path = %self.path.display(), "Failed to close mapped buffer.");
        }
    }
}
