//! # Two-copy barrier buffer
//!
//! The crash-safe default for persistent files.  Provides barrier semantics
//! without an `fsync` per barrier while guaranteeing that after any crash
//! the file is recoverable to one of two consistent states: the last durable
//! state, or the state one forced barrier older.
//!
//! ## On-disk scheme
//!
//! For a logical path `P` there are up to three files: `P`, `P.new`, and
//! `P.old` (plus a `P.lock` advisory lock file that is never renamed).  At
//! rest only `P` and `P.old` exist; `P` holds the latest durable state and
//! `P.old` a previous one.  Cached writes commit with an atomic swap:
//!
//!   1. rename `P.old` → `P.new`
//!   2. write every differing sector into `P.new`; optionally fsync
//!   3. rename `P` → `P.old`
//!   4. rename `P.new` → `P`
//!
//! Every crash point leaves a file-set combination that open-time recovery
//! maps back to a consistent state:
//!
//!   base | .new | .old | action at open
//!   -----|------|------|--------------------------------------------
//!    yes |  no  | yes  | normal; load `base`
//!    yes | yes  |  no  | crash during step 2/3; rename `.new` → `.old`
//!    yes | yes  | yes  | stray partial copy; delete `.new`
//!    yes |  no  |  no  | create empty `.old`
//!     no | yes  | yes  | crash between steps 3 and 4; rename `.new` → `base`
//!     no |  no  |  no  | fresh; create empty `base` and `.old`
//!     no |  no  | yes  | outside interference; error
//!     no | yes  |  no  | outside interference; error
//!
//! ## Write cache
//!
//! Writes are buffered in memory as sector-aligned byte arrays (sector size
//! is a configurable power of two, 4096 by default).  Two views are kept:
//! the *superset* cache of sectors that differ from `P.old`, which also
//! serves reads without touching the file, and the *dirty* subset of sectors
//! that differ from `P`, which is what a crash before the next commit would
//! lose.  Step 2 writes the superset (the renamed `P.old` is two commits
//! stale); after the swap the old dirty subset becomes the new superset.
//! At open the superset is primed by a sector-by-sector comparison of `P`
//! and `P.old`, so the first commit writes only sectors that actually
//! differ.
//!
//! Every `put` compares the incoming bytes against the cached (or on-disk)
//! value and drops the write when nothing changes, keeping rewrites of
//! identical data off flash storage entirely.
//!
//! ## Commit triggers
//!
//! (a) `barrier(true)` at protection level `Force` commits immediately with
//! fsync; (b) any other barrier commits once the oldest uncommitted write is
//! older than the synchronous commit delay; (c) a shared timer thread
//! commits buffers whose oldest uncommitted write exceeds the asynchronous
//! commit delay; (d) `close` commits; (e) [`commit_all`] commits every
//! registered instance, for embedding in a host's shutdown path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use snafu::{ensure, ResultExt, Snafu};

use super::file::{read_full_at, write_all_at};
use super::lock::FileLock;
use super::{BufferError, IoSnafu, PersistentBuffer, ProtectionLevel};

/// Default sector size for the write cache.
pub const DEFAULT_SECTOR_SIZE: u64 = 4096;

/// Default delay before a plain `barrier` call commits cached writes.
pub const DEFAULT_SYNCHRONOUS_COMMIT_DELAY: Duration = Duration::from_millis(60_000);

/// Default delay before the shared timer commits cached writes on its own.
pub const DEFAULT_ASYNCHRONOUS_COMMIT_DELAY: Duration = Duration::from_millis(5000);

const TIMER_TICK: Duration = Duration::from_millis(500);

/// Error from [`TwoCopyConfigBuilder::build`].
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Two-copy buffer configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TwoCopyConfig {
    /// Unit of write caching; a power of two.
    pub(crate) sector_size: u64,

    /// How long cached writes may sit before a plain barrier commits them.
    pub(crate) synchronous_commit_delay: Duration,

    /// How long cached writes may sit before the shared timer commits them.
    /// `None` disables timer-driven commits.
    pub(crate) asynchronous_commit_delay: Option<Duration>,

    /// Durability policy.
    pub(crate) protection: ProtectionLevel,
}

impl Default for TwoCopyConfig {
    fn default() -> Self {
        TwoCopyConfigBuilder::new()
            .build()
            .expect("default configuration is valid")
    }
}

/// Builder for [`TwoCopyConfig`].
#[derive(Clone, Debug, Default)]
pub struct TwoCopyConfigBuilder {
    sector_size: Option<u64>,
    synchronous_commit_delay: Option<Duration>,
    asynchronous_commit_delay: Option<Option<Duration>>,
    protection: Option<ProtectionLevel>,
}

impl TwoCopyConfigBuilder {
    pub fn new() -> TwoCopyConfigBuilder {
        TwoCopyConfigBuilder::default()
    }

    /// Sets the sector size, in bytes.  Must be a power of two.
    ///
    /// Defaults to 4096.
    pub fn sector_size(mut self, sector_size: u64) -> Self {
        self.sector_size = Some(sector_size);
        self
    }

    /// Sets how long cached writes may sit before a plain `barrier` call
    /// commits them.
    ///
    /// Defaults to 60 seconds.
    pub fn synchronous_commit_delay(mut self, delay: Duration) -> Self {
        self.synchronous_commit_delay = Some(delay);
        self
    }

    /// Sets how long cached writes may sit before the shared timer commits
    /// them, or `None` to disable timer-driven commits.
    ///
    /// Defaults to 5 seconds.
    pub fn asynchronous_commit_delay(mut self, delay: Option<Duration>) -> Self {
        self.asynchronous_commit_delay = Some(delay);
        self
    }

    /// Sets the durability policy.
    ///
    /// Defaults to [`ProtectionLevel::Barrier`].
    pub fn protection(mut self, protection: ProtectionLevel) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Consumes this builder and constructs a [`TwoCopyConfig`].
    pub fn build(self) -> Result<TwoCopyConfig, BuildError> {
        let sector_size = self.sector_size.unwrap_or(DEFAULT_SECTOR_SIZE);
        if !sector_size.is_power_of_two() {
            return Err(BuildError::InvalidParameter {
                param_name: "sector_size",
                reason: format!("must be a power of two, got {sector_size}"),
            });
        }
        Ok(TwoCopyConfig {
            sector_size,
            synchronous_commit_delay: self
                .synchronous_commit_delay
                .unwrap_or(DEFAULT_SYNCHRONOUS_COMMIT_DELAY),
            asynchronous_commit_delay: self
                .asynchronous_commit_delay
                .unwrap_or(Some(DEFAULT_ASYNCHRONOUS_COMMIT_DELAY)),
            protection: self.protection.unwrap_or(ProtectionLevel::Barrier),
        })
    }
}

struct OpenState {
    _lock: FileLock,
    /// Read-only handle serving cache misses.  It alternates between the
    /// `base` and `base.old` inodes as commits rename them, and stays
    /// correct either way: sectors absent from the superset cache are
    /// identical in both copies.
    reader: File,
    capacity: u64,
    /// Sector index → sector bytes differing from `base.old`.  Serves reads.
    cache: BTreeMap<u64, Vec<u8>>,
    /// Sector indices differing from `base`.  Always a subset of `cache`.
    dirty: BTreeSet<u64>,
    /// Length of `base` as of the last commit.
    committed_len: u64,
    /// Length of `base.old`.
    old_len: u64,
    /// Lowest capacity seen since the last commit, when a shrink happened.
    low_capacity: Option<u64>,
    first_uncommitted: Option<Instant>,
}

struct Shared {
    base: PathBuf,
    new_path: PathBuf,
    old_path: PathBuf,
    config: TwoCopyConfig,
    state: Mutex<Option<OpenState>>,
}

/// A [`PersistentBuffer`] whose commits atomically swap between two on-disk
/// copies.
///
/// See the [module docs][self] for the protocol.
pub struct TwoCopyBarrierBuffer {
    shared: Arc<Shared>,
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl TwoCopyBarrierBuffer {
    /// Opens the two-copy file set rooted at `path`, recovering from any
    /// crash-interrupted commit first.
    ///
    /// # Errors
    ///
    /// Fails if the file set is in a combination the commit protocol cannot
    /// produce (outside interference), if another process holds the lock, or
    /// on any underlying I/O error.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: TwoCopyConfig,
    ) -> Result<TwoCopyBarrierBuffer, BufferError> {
        let base = path.as_ref().to_path_buf();
        let new_path = sibling(&base, ".new");
        let old_path = sibling(&base, ".old");
        let lock_path = sibling(&base, ".lock");
        let writable = config.protection.is_writable();

        let lock = FileLock::acquire(&lock_path, !writable)?;

        if writable {
            Self::resolve_file_set(&base, &new_path, &old_path)?;
        } else {
            ensure!(
                base.exists(),
                super::InconsistentFileSetSnafu {
                    path: base.clone(),
                    detail: "base copy missing on read-only open",
                }
            );
        }

        let reader = File::options().read(true).open(&base).context(IoSnafu)?;
        let capacity = reader.metadata().context(IoSnafu)?.len();
        let old_len = if writable {
            fs::metadata(&old_path).context(IoSnafu)?.len()
        } else {
            0
        };

        let cache = if writable {
            Self::prime_cache(&reader, capacity, &old_path, old_len, config.sector_size)?
        } else {
            BTreeMap::new()
        };
        if !cache.is_empty() {
            debug!(
                path = %base.display(),
                differing_sectors = cache.len(),
                "Primed write cache from copy comparison."
            );
        }

        let shared = Arc::new(Shared {
            base,
            new_path,
            old_path,
            config,
            state: Mutex::new(Some(OpenState {
                _lock: lock,
                reader,
                capacity,
                cache,
                dirty: BTreeSet::new(),
                committed_len: capacity,
                old_len,
                low_capacity: None,
                first_uncommitted: None,
            })),
        });

        if writable && shared.config.asynchronous_commit_delay.is_some() {
            registry().register(&shared);
        }

        Ok(TwoCopyBarrierBuffer { shared })
    }

    /// Logical path of this buffer (the `base` copy).
    pub fn path(&self) -> &Path {
        &self.shared.base
    }

    /// Applies the open-time recovery rules to the file set.
    fn resolve_file_set(base: &Path, new_path: &Path, old_path: &Path) -> Result<(), BufferError> {
        let base_exists = base.exists();
        let new_exists = new_path.exists();
        let old_exists = old_path.exists();

        match (base_exists, new_exists, old_exists) {
            (true, false, true) => {}
            (true, true, false) => {
                // Crash during step 2 or 3: the partial copy goes back to
                // being the old copy.  Its content need not be a consistent
                // snapshot; the old copy is only a sector-diff staging area.
                info!(path = %base.display(), "Recovering interrupted commit: restoring old copy.");
                fs::rename(new_path, old_path).context(IoSnafu)?;
            }
            (true, true, true) => {
                info!(path = %base.display(), "Recovering interrupted commit: discarding partial copy.");
                fs::remove_file(new_path).context(IoSnafu)?;
            }
            (true, false, false) => {
                File::create(old_path).context(IoSnafu)?;
            }
            (false, true, true) => {
                // Crash between steps 3 and 4: the new copy is complete.
                info!(path = %base.display(), "Recovering interrupted commit: promoting new copy.");
                fs::rename(new_path, base).context(IoSnafu)?;
            }
            (false, false, false) => {
                File::create(base).context(IoSnafu)?;
                File::create(old_path).context(IoSnafu)?;
            }
            (false, false, true) => {
                return Err(BufferError::InconsistentFileSet {
                    path: base.to_path_buf(),
                    detail: "old copy exists without a base copy",
                });
            }
            (false, true, false) => {
                return Err(BufferError::InconsistentFileSet {
                    path: base.to_path_buf(),
                    detail: "new copy exists without base and old copies",
                });
            }
        }
        Ok(())
    }

    /// Builds the initial superset cache: every sector where `base` and
    /// `base.old` differ, holding `base`'s content.
    fn prime_cache(
        reader: &File,
        base_len: u64,
        old_path: &Path,
        old_len: u64,
        sector_size: u64,
    ) -> Result<BTreeMap<u64, Vec<u8>>, BufferError> {
        let mut cache = BTreeMap::new();
        let old = File::options().read(true).open(old_path).context(IoSnafu)?;
        let sector_size_us = usize::try_from(sector_size).expect("sector size fits usize");
        let limit = base_len.max(old_len);
        let mut base_sector = vec![0u8; sector_size_us];
        let mut old_sector = vec![0u8; sector_size_us];
        let mut position = 0;
        while position < limit {
            let read = read_full_at(reader, position, &mut base_sector).context(IoSnafu)?;
            base_sector[read..].fill(0);
            let read = read_full_at(&old, position, &mut old_sector).context(IoSnafu)?;
            old_sector[read..].fill(0);
            if base_sector != old_sector {
                cache.insert(position / sector_size, base_sector.clone());
            }
            position += sector_size;
        }
        Ok(cache)
    }
}

impl Shared {
    fn sector_size(&self) -> u64 {
        self.config.sector_size
    }

    /// Loads the current content of one whole sector, from the cache or the
    /// underlying copy, zero-padded past end of file.
    fn load_sector(&self, open: &OpenState, sector: u64) -> Result<Vec<u8>, BufferError> {
        if let Some(bytes) = open.cache.get(&sector) {
            return Ok(bytes.clone());
        }
        let sector_size = usize::try_from(self.sector_size()).expect("sector size fits usize");
        let mut bytes = vec![0u8; sector_size];
        let read = read_full_at(&open.reader, sector * self.sector_size(), &mut bytes)
            .context(IoSnafu)?;
        bytes[read..].fill(0);
        Ok(bytes)
    }

    fn needs_commit(open: &OpenState) -> bool {
        !open.dirty.is_empty() || open.capacity != open.committed_len
    }

    /// Runs the four-step atomic swap, making the in-memory state the
    /// durable `base` copy.
    fn commit(&self, open: &mut OpenState, fsync: bool) -> Result<(), BufferError> {
        if !Self::needs_commit(open) {
            open.first_uncommitted = None;
            return Ok(());
        }

        trace!(
            path = %self.base.display(),
            sectors = open.cache.len(),
            dirty = open.dirty.len(),
            capacity = open.capacity,
            fsync,
            "Committing cached writes."
        );

        // Step 1: the old copy becomes the staging copy.
        fs::rename(&self.old_path, &self.new_path).context(IoSnafu)?;

        // Step 2: bring the staging copy up to the in-memory state.  The
        // superset cache is exactly the set of sectors where it is stale.
        {
            let new_file = File::options()
                .read(true)
                .write(true)
                .open(&self.new_path)
                .context(IoSnafu)?;
            for (&sector, bytes) in &open.cache {
                let start = sector * self.sector_size();
                if start >= open.capacity {
                    continue;
                }
                let len = usize::try_from((open.capacity - start).min(self.sector_size()))
                    .expect("sector size fits usize");
                write_all_at(&new_file, start, &bytes[..len]).context(IoSnafu)?;
            }
            new_file.set_len(open.capacity).context(IoSnafu)?;
            if fsync {
                new_file.sync_all().context(IoSnafu)?;
            }
        }

        // Steps 3 and 4: swap the copies.
        fs::rename(&self.base, &self.old_path).context(IoSnafu)?;
        fs::rename(&self.new_path, &self.base).context(IoSnafu)?;
        if fsync {
            sync_parent_dir(&self.base).context(IoSnafu)?;
        }

        // The just-written copy is now `base`; the former `base` is the old
        // copy.  Sectors that were dirty against the former base are exactly
        // those now differing from the old copy.
        let dirty = std::mem::take(&mut open.dirty);
        open.cache.retain(|sector, _| dirty.contains(sector));
        open.old_len = open.committed_len;
        open.committed_len = open.capacity;
        open.low_capacity = None;
        open.first_uncommitted = None;
        Ok(())
    }

    /// Commits if the oldest uncommitted write is older than `delay`.
    fn commit_if_older(
        &self,
        open: &mut OpenState,
        delay: Duration,
        fsync: bool,
    ) -> Result<(), BufferError> {
        if let Some(first) = open.first_uncommitted {
            if first.elapsed() >= delay {
                self.commit(open, fsync)?;
            }
        }
        Ok(())
    }
}

impl PersistentBuffer for TwoCopyBarrierBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.shared.config.protection
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        let state = self.shared.state.lock();
        let open = state.as_ref().ok_or(BufferError::Closed)?;
        Ok(open.capacity)
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        ensure!(
            self.shared.config.protection.is_writable(),
            super::ReadOnlySnafu
        );
        let sector_size = self.shared.sector_size();
        let mut state = self.shared.state.lock();
        let open = state.as_mut().ok_or(BufferError::Closed)?;
        if capacity == open.capacity {
            return Ok(());
        }

        if capacity < open.capacity {
            // Drop cached sectors past the new end and zero the tail of the
            // boundary sector; a later re-grow must read zeros here.
            let boundary = capacity / sector_size;
            let within = usize::try_from(capacity % sector_size).expect("fits usize");
            open.cache.retain(|&sector, _| sector <= boundary);
            open.dirty.retain(|&sector| sector <= boundary);
            if within != 0 {
                let mut bytes = self.shared.load_sector(open, boundary)?;
                if bytes[within..].iter().any(|&b| b != 0) {
                    bytes[within..].fill(0);
                    open.cache.insert(boundary, bytes);
                    open.dirty.insert(boundary);
                }
            } else {
                open.cache.remove(&boundary);
                open.dirty.remove(&boundary);
            }
            open.low_capacity = Some(open.low_capacity.map_or(capacity, |low| low.min(capacity)));
        } else if let Some(low) = open.low_capacity {
            // Re-growing past an uncommitted shrink: the underlying copies
            // still hold pre-shrink data there, so pin zeros in the cache
            // for every fully re-exposed sector the copies cover.
            let limit = capacity.min(open.committed_len.max(open.old_len));
            if low < limit {
                let first = (low + sector_size - 1) / sector_size;
                let last = (limit + sector_size - 1) / sector_size;
                let zeroed = vec![0u8; usize::try_from(sector_size).expect("fits usize")];
                for sector in first..last {
                    open.cache.insert(sector, zeroed.clone());
                    open.dirty.insert(sector);
                }
            }
            open.low_capacity = None;
        }

        open.capacity = capacity;
        if open.first_uncommitted.is_none() {
            open.first_uncommitted = Some(Instant::now());
        }
        Ok(())
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        let sector_size = self.shared.sector_size();
        let state = self.shared.state.lock();
        let open = state.as_ref().ok_or(BufferError::Closed)?;
        if position >= open.capacity {
            return Ok(0);
        }
        let available = usize::try_from((open.capacity - position).min(buf.len() as u64))
            .expect("fits usize");
        let mut copied = 0;
        while copied < available {
            let pos = position + copied as u64;
            let sector = pos / sector_size;
            let within = usize::try_from(pos % sector_size).expect("fits usize");
            let step = (available - copied)
                .min(usize::try_from(sector_size).expect("fits usize") - within);
            match open.cache.get(&sector) {
                Some(bytes) => {
                    buf[copied..copied + step].copy_from_slice(&bytes[within..within + step]);
                }
                None => {
                    let out = &mut buf[copied..copied + step];
                    let read = read_full_at(&open.reader, pos, out).context(IoSnafu)?;
                    out[read..].fill(0);
                }
            }
            copied += step;
        }
        Ok(available)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        ensure!(
            self.shared.config.protection.is_writable(),
            super::ReadOnlySnafu
        );
        let sector_size = self.shared.sector_size();
        let mut state = self.shared.state.lock();
        let open = state.as_mut().ok_or(BufferError::Closed)?;
        let end = position + buf.len() as u64;
        ensure!(
            end <= open.capacity,
            super::OutOfBoundsSnafu {
                position: end,
                capacity: open.capacity,
            }
        );

        let mut copied = 0;
        while copied < buf.len() {
            let pos = position + copied as u64;
            let sector = pos / sector_size;
            let within = usize::try_from(pos % sector_size).expect("fits usize");
            let step = (buf.len() - copied)
                .min(usize::try_from(sector_size).expect("fits usize") - within);
            let incoming = &buf[copied..copied + step];

            match open.cache.get_mut(&sector) {
                Some(bytes) => {
                    if &bytes[within..within + step] != incoming {
                        bytes[within..within + step].copy_from_slice(incoming);
                        open.dirty.insert(sector);
                        if open.first_uncommitted.is_none() {
                            open.first_uncommitted = Some(Instant::now());
                        }
                    }
                }
                None => {
                    // Compare before caching: identical rewrites never reach
                    // storage.
                    let mut bytes = self.shared.load_sector(open, sector)?;
                    if &bytes[within..within + step] != incoming {
                        bytes[within..within + step].copy_from_slice(incoming);
                        open.cache.insert(sector, bytes);
                        open.dirty.insert(sector);
                        if open.first_uncommitted.is_none() {
                            open.first_uncommitted = Some(Instant::now());
                        }
                    }
                }
            }
            copied += step;
        }
        Ok(())
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        let mut state = self.shared.state.lock();
        let open = state.as_mut().ok_or(BufferError::Closed)?;
        match self.shared.config.protection {
            ProtectionLevel::ReadOnly | ProtectionLevel::None => Ok(()),
            ProtectionLevel::Barrier => self.shared.commit_if_older(
                open,
                self.shared.config.synchronous_commit_delay,
                false,
            ),
            ProtectionLevel::Force => {
                if force {
                    self.shared.commit(open, true)
                } else {
                    self.shared.commit_if_older(
                        open,
                        self.shared.config.synchronous_commit_delay,
                        false,
                    )
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), BufferError> {
        let mut state = self.shared.state.lock();
        if let Some(mut open) = state.take() {
            if self.shared.config.protection.is_writable() {
                let fsync = self.shared.config.protection == ProtectionLevel::Force;
                let result = self.shared.commit(&mut open, fsync);
                if result.is_err() {
                    // Put the state back so a retried close can commit again.
                    *state = Some(open);
                    return result;
                }
            }
        }
        Ok(())
    }
}

impl Drop for TwoCopyBarrierBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            error!(%error, path = %self.shared.base.display(), "Failed to commit on drop.");
        }
    }
}

impl std::fmt::Debug for TwoCopyBarrierBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        let mut dbg = f.debug_struct("TwoCopyBarrierBuffer");
        dbg.field("path", &self.shared.base)
            .field("config", &self.shared.config);
        match state.as_ref() {
            Some(open) => dbg
                .field("capacity", &open.capacity)
                .field("cached_sectors", &open.cache.len())
                .field("dirty_sectors", &open.dirty.len())
                .finish_non_exhaustive(),
            None => dbg.field("closed", &true).finish_non_exhaustive(),
        }
    }
}

/// Process-wide registry of open two-copy buffers, serviced by the shared
/// commit timer thread.
struct Registry {
    buffers: Mutex<Vec<Weak<Shared>>>,
    wake: Condvar,
}

impl Registry {
    fn register(&self, shared: &Arc<Shared>) {
        let mut buffers = self.buffers.lock();
        buffers.retain(|weak| weak.strong_count() > 0);
        buffers.push(Arc::downgrade(shared));
        self.wake.notify_one();
    }

    fn snapshot(&self) -> Vec<Arc<Shared>> {
        let mut buffers = self.buffers.lock();
        buffers.retain(|weak| weak.strong_count() > 0);
        buffers.iter().filter_map(Weak::upgrade).collect()
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: Lazy<&'static Registry> = Lazy::new(|| {
        let registry: &'static Registry = Box::leak(Box::new(Registry {
            buffers: Mutex::new(Vec::new()),
            wake: Condvar::new(),
        }));
        std::thread::Builder::new()
            .name("seqstore-commit-timer".to_string())
            .spawn(move || timer_loop(registry))
            .expect("failed to spawn commit timer thread");
        registry
    });
    *REGISTRY
}

fn timer_loop(registry: &'static Registry) {
    let mut idle = registry.buffers.lock();
    loop {
        let _ = registry.wake.wait_for(&mut idle, TIMER_TICK);
        let buffers: Vec<Arc<Shared>> = idle.iter().filter_map(Weak::upgrade).collect();
        drop(idle);

        for shared in buffers {
            let Some(delay) = shared.config.asynchronous_commit_delay else {
                continue;
            };
            let mut state = shared.state.lock();
            if let Some(open) = state.as_mut() {
                if let Err(error) = shared.commit_if_older(open, delay, false) {
                    error!(
                        %error,
                        path = %shared.base.display(),
                        "Timer-driven commit failed."
                    );
                }
            }
        }

        idle = registry.buffers.lock();
    }
}

/// Commits every registered two-copy buffer with uncommitted writes.
///
/// Intended for a host process's shutdown path; dropping a buffer also
/// commits, but this makes the sweep explicit and reports the first error.
pub fn commit_all() -> Result<(), BufferError> {
    let mut first_error = None;
    for shared in registry().snapshot() {
        let mut state = shared.state.lock();
        if let Some(open) = state.as_mut() {
            let fsync = shared.config.protection == ProtectionLevel::Force;
            if let Err(error) = shared.commit(open, fsync) {
                error!(%error, path = %shared.base.display(), "Shutdown commit failed.");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
