//! Whole-file advisory locks.
//!
//! Every buffer variant locks its backing file for the lifetime of the
//! handle: shared when opened read-only, exclusive otherwise.  The lock is
//! advisory; it prevents two cooperating processes from opening the same
//! file, nothing more.
//!
//! Locks attach to the open file description, so a buffer that keeps its
//! `File` alive keeps its lock.  The two-copy buffer cannot lock its data
//! file directly (the commit protocol renames it), so it locks a sibling
//! `<path>.lock` file that is never renamed.

use std::fs::File;
use std::path::Path;

use crate::buffer::BufferError;

#[cfg(unix)]
fn flock_nonblocking(file: &File, shared: bool) -> Result<bool, std::io::Error> {
    use std::os::unix::io::AsRawFd;

    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};

    let arg = if shared {
        FlockArg::LockSharedNonblock
    } else {
        FlockArg::LockExclusiveNonblock
    };
    match flock(file.as_raw_fd(), arg) {
        Ok(()) => Ok(true),
        Err(Errno::EWOULDBLOCK) => Ok(false),
        Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(not(unix))]
fn flock_nonblocking(_file: &File, _shared: bool) -> Result<bool, std::io::Error> {
    // Advisory locking degrades to a no-op on platforms without flock.
    Ok(true)
}

/// Locks `file` for the lifetime of its open file description.
///
/// The caller keeps `file` open for as long as the lock must hold; closing
/// the handle releases it.
pub(crate) fn lock_handle(file: &File, path: &Path, shared: bool) -> Result<(), BufferError> {
    use snafu::ResultExt;

    let acquired = flock_nonblocking(file, shared).context(super::IoSnafu)?;
    if !acquired {
        return Err(BufferError::LockAlreadyHeld {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// An advisory lock held through a dedicated lock file.
///
/// Dropping the guard closes the handle and releases the lock.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Creates (if needed) and locks `path`.
    pub(crate) fn acquire(path: &Path, shared: bool) -> Result<FileLock, BufferError> {
        use snafu::ResultExt;

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(super::IoSnafu)?;
        lock_handle(&file, path, shared)?;
        Ok(FileLock { _file: file })
    }
}
