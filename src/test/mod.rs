//! In-memory stand-ins for the production buffers, used across the test
//! suites.

use crate::buffer::{BufferError, PersistentBuffer, ProtectionLevel};

pub(crate) use fault::FaultInjectingBuffer;

/// Installs a tracing subscriber when `SEQSTORE_TEST_LOG` is set, so the
/// recovery and commit records emitted under test can be inspected:
///
/// ```text
/// SEQSTORE_TEST_LOG=seqstore=trace cargo test -- --nocapture
/// ```
///
/// Without the variable this is a no-op; repeated calls are harmless.
pub(crate) fn init_test_logging() {
    if std::env::var_os("SEQSTORE_TEST_LOG").is_none() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::from_env("SEQSTORE_TEST_LOG");
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A `Vec<u8>`-backed buffer: no file, no locks, no durability.
///
/// Barriers are accepted and ignored, which is exactly what protection
/// level `None` promises.
#[derive(Debug, Default)]
pub(crate) struct MemoryBuffer {
    data: Vec<u8>,
    protection: ProtectionLevel,
    closed: bool,
}

impl MemoryBuffer {
    pub(crate) fn new() -> MemoryBuffer {
        MemoryBuffer {
            data: Vec::new(),
            protection: ProtectionLevel::Barrier,
            closed: false,
        }
    }

    pub(crate) fn with_protection(protection: ProtectionLevel) -> MemoryBuffer {
        MemoryBuffer {
            data: Vec::new(),
            protection,
            closed: false,
        }
    }

    /// Seeds the buffer with existing content, as if reopening a file.
    pub(crate) fn from_bytes(data: Vec<u8>) -> MemoryBuffer {
        MemoryBuffer {
            data,
            protection: ProtectionLevel::Barrier,
            closed: false,
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn check_open(&self) -> Result<(), BufferError> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        Ok(())
    }
}

impl PersistentBuffer for MemoryBuffer {
    fn protection_level(&self) -> ProtectionLevel {
        self.protection
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        self.check_open()?;
        Ok(self.data.len() as u64)
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        self.check_open()?;
        if !self.protection.is_writable() {
            return Err(BufferError::ReadOnly);
        }
        let capacity = usize::try_from(capacity).expect("test capacities fit in memory");
        self.data.resize(capacity, 0);
        Ok(())
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        self.check_open()?;
        let len = self.data.len() as u64;
        if position >= len {
            return Ok(0);
        }
        let available = usize::try_from((len - position).min(buf.len() as u64)).expect("fits");
        let start = usize::try_from(position).expect("fits");
        buf[..available].copy_from_slice(&self.data[start..start + available]);
        Ok(available)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        self.check_open()?;
        if !self.protection.is_writable() {
            return Err(BufferError::ReadOnly);
        }
        let end = position + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(BufferError::OutOfBounds {
                position: end,
                capacity: self.data.len() as u64,
            });
        }
        let start = usize::try_from(position).expect("fits");
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn barrier(&mut self, _force: bool) -> Result<(), BufferError> {
        self.check_open()
    }

    fn close(&mut self) -> Result<(), BufferError> {
        self.closed = true;
        Ok(())
    }
}

/// Counts the writes reaching an inner buffer; used to verify that
/// `ensure_zeros` and the two-copy write-skip issue no redundant writes.
#[derive(Debug)]
pub(crate) struct CountingBuffer<B: PersistentBuffer> {
    inner: B,
    puts: u64,
}

impl<B: PersistentBuffer> CountingBuffer<B> {
    pub(crate) fn new(inner: B) -> CountingBuffer<B> {
        CountingBuffer { inner, puts: 0 }
    }

    pub(crate) fn puts(&self) -> u64 {
        self.puts
    }
}

impl<B: PersistentBuffer> PersistentBuffer for CountingBuffer<B> {
    fn protection_level(&self) -> ProtectionLevel {
        self.inner.protection_level()
    }

    fn capacity(&self) -> Result<u64, BufferError> {
        self.inner.capacity()
    }

    fn set_capacity(&mut self, capacity: u64) -> Result<(), BufferError> {
        self.inner.set_capacity(capacity)
    }

    fn get_some(&self, position: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        self.inner.get_some(position, buf)
    }

    fn put(&mut self, position: u64, buf: &[u8]) -> Result<(), BufferError> {
        self.puts += 1;
        self.inner.put(position, buf)
    }

    fn barrier(&mut self, force: bool) -> Result<(), BufferError> {
        self.inner.barrier(force)
    }

    fn close(&mut self) -> Result<(), BufferError> {
        self.inner.close()
    }
}
