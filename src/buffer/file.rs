//! Direct positioned-I/O buffer.
//!
//! No memory mapping: every access is a positioned read or write against the
//! backing file.  The operating system orders same-handle writes, so
//! `barrier(false)` is a no-op; `barrier(true)` invokes the sync-file
//! primitive when the protection level calls for it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use snafu::{ensure, ResultExt};

use super::{lock, BufferError, IoSnafu, PersistentBuffer, ProtectionLevel};

/// Reads up to `buf.len()` bytes at `position`, stopping early only at end
/// of file.  Returns how many bytes were read.
pub(crate) fn read_full_at(file: &File, position: u64, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let read = read_at(file, position + total as u64, &mut buf[total..])?;
        if read == 0 {
            break;
        }
        total += read;
    }
    Ok(total)
}

/// Writes all of `buf` at `position`.
pub(crate) fn write_all_at(file: &File, position: u64, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = write_at(file, position + written as u64, &buf[written..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "positioned write made no progress",
            ));
        }
        written += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, position: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, position)
}

#[cfg(unix)]
fn write_at(file: &File, position: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, position)
}

#[cfg(windows)]
fn read_at(file: &File, position: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, position)
}

#[cfg(windows)]
fn write_at(file: &File, position: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, position)
}

/// A [`PersistentBuffer`] that seeks and reads/writes the backing file on
/// every access.
#[derive(Debug)]
pub struct FileBuffer {
    file: Option<File>,
    path: PathBuf,
    protection: ProtectionLevel,
    capacity: u64,
}

impl FileBuffer {
    /// Opens (creating if writable and absent) the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, or if another process holds a
    /// conflicting advisory lock on it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        protection: ProtectionLevel,
    ) -> Result<FileBuffer, BufferError> {
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
        Ok(FileBuffer {
            file: Some(file),
            path,
            protection,
            capacity,
        })
    }

    /// Path this buffer was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File, BufferError> {
        self.file.as_ref().ok_or(BufferError::Closed)
    }

    fn writable_file(&self) -> Result<&File, BufferError> {
        ensure!(self.protection.is_writable(), super::ReadOnlySnafu);
        self.file()
    }
}

impl PersistentBuffer for FileBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        self.file()?;
        Ok(self.capacity)
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        let file = self.writable_file()?;
        // set_len zero-fills growth (sparsely, where the filesystem allows).
        file.set_len(capacity).context(IoSnafu)?;
        self.capacity = capacity;
        Ok(())
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        let file = self.file()?;
        if position >= self.capacity {
            return Ok(0);
        }
        let available =
            usize::try_from((self.capacity - position).min(buf.len() as u64)).expect("fits usize");
        let read = read_full_at(file, position, &mut buf[..available]).context(IoSnafu)?;
        // The file can be shorter than the logical capacity only transiently;
        // any shortfall reads as zeros.
        buf[read..available].fill(0);
        Ok(available)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        let file = self.writable_file()?;
        let end = position + buf.len() as u64;
        ensure!(
            end <= self.capacity,
            super::OutOfBoundsSnafu {
                position: end,
                capacity: self.capacity,
            }
        );
        write_all_at(file, position, buf).context(IoSnafu)
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        let file = self.file()?;
        match self.protection {
            ProtectionLevel::ReadOnly | ProtectionLevel::None => Ok(()),
            // The OS orders positioned writes on one handle; only a forced
            // barrier needs the sync-file primitive.
            ProtectionLevel::Barrier | ProtectionLevel::Force => {
                if force {
                    file.sync_all().context(IoSnafu)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), BufferError> {
        if let Some(file) = self.file.take() {
            if self.protection.is_writable() {
                file.sync_all().context(IoSnafu)?;
            }
        }
        Ok(())
    }
}

impl Drop for FileBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!(%error, path = %self.path.display(), "Failed to close file buffer.");
        }
    }
}
