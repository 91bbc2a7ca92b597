//! Collaborator interfaces: the physical block layer and secondary devices.
//!
//! The cache never performs I/O on its own. Misses are fetched and writes are
//! made durable through a [`BlockIo`] implementation supplied at init; the
//! second tier copies buffers to [`SecondaryDevice`]s attached at run time.
//!
//! [`BlockIo`] is completion based: the cache hands over the destination (or
//! source) memory together with a callback and the implementation calls it
//! exactly once, from whatever thread it likes. Memory is passed by value so a
//! read can fill the cache's own allocation without copying, and the buffer is
//! handed back in the callback either way.
//!
//! In-memory implementations of both interfaces are provided for tests,
//! simulations and benchmarks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::BlockId;

/// Scheduling class of a physical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    /// A caller is blocked on the result.
    Sync,
    /// Completion is delivered through a callback.
    Async,
    /// Speculative read-ahead.
    Prefetch,
}

/// Completion of a physical read: the destination memory and the outcome.
pub type ReadDone = Box<dyn FnOnce(Vec<u8>, io::Result<()>) + Send>;

/// Completion of a physical write: the source memory and the final identity
/// the block was written under.
pub type WriteDone = Box<dyn FnOnce(Vec<u8>, io::Result<BlockId>) + Send>;

/// The physical block layer below the cache.
pub trait BlockIo: Send + Sync {
    /// Reads block `id` into `dest` (already sized to the block) and calls
    /// `done` exactly once.
    fn read(&self, id: &BlockId, dest: Vec<u8>, priority: Priority, done: ReadDone);

    /// Writes `data` for `id` and calls `done` exactly once with the identity
    /// the block can be read back under.
    fn write(&self, id: &BlockId, data: Vec<u8>, priority: Priority, done: WriteDone);
}

/// A block device used as a second cache tier.
///
/// Offsets handed to the device are always multiples of [`alignment`].
///
/// [`alignment`]: SecondaryDevice::alignment
pub trait SecondaryDevice: Send + Sync {
    /// Usable length in bytes.
    fn capacity(&self) -> u64;

    /// Allocation granularity; record sizes are rounded up to it.
    fn alignment(&self) -> u64 {
        512
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// In-memory physical layer.
///
/// Writes with a zero birth are assigned the next generation, and writes to
/// the anonymous location are assigned a fresh location, mimicking an
/// allocator. Completions run inline unless [`MemoryBlockIo::asynchronous`]
/// is set, in which case every completion runs on its own thread.
#[derive(Debug, Default)]
pub struct MemoryBlockIo {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
    next: AtomicU64,
    async_completions: AtomicBool,
    fail_reads: AtomicU64,
    fail_writes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBlockIo {
    /// Creates an empty backing store.
    pub fn new() -> Self {
        MemoryBlockIo {
            next: AtomicU64::new(1),
            ..MemoryBlockIo::default()
        }
    }

    /// Deliver completions from separate threads.
    pub fn asynchronous(self) -> Self {
        self.async_completions.store(true, Ordering::Relaxed);
        self
    }

    /// Stores a block directly, as if it had been written earlier.
    pub fn insert(&self, id: BlockId, data: Vec<u8>) {
        self.blocks.lock().insert(id, data);
    }

    /// Current content of a block, bypassing any cache.
    pub fn get(&self, id: &BlockId) -> Option<Vec<u8>> {
        self.blocks.lock().get(id).cloned()
    }

    /// Fails the next `n` reads with an I/O error.
    pub fn fail_next_reads(&self, n: u64) {
        self.fail_reads.store(n, Ordering::Relaxed);
    }

    /// Fails the next `n` writes with an I/O error.
    pub fn fail_next_writes(&self, n: u64) {
        self.fail_writes.store(n, Ordering::Relaxed);
    }

    /// Reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Writes served so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn complete(&self, f: impl FnOnce() + Send + 'static) {
        if self.async_completions.load(Ordering::Relaxed) {
            thread::spawn(f);
        } else {
            f();
        }
    }
}

impl BlockIo for MemoryBlockIo {
    fn read(&self, id: &BlockId, mut dest: Vec<u8>, _priority: Priority, done: ReadDone) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let result = if Self::take_failure(&self.fail_reads) {
            Err(io::Error::other("injected read failure"))
        } else {
            match self.blocks.lock().get(id) {
                Some(data) => {
                    let n = data.len().min(dest.len());
                    dest[..n].copy_from_slice(&data[..n]);
                    Ok(())
                }
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no block {id:?}"),
                )),
            }
        };
        self.complete(move || done(dest, result));
    }

    fn write(&self, id: &BlockId, data: Vec<u8>, _priority: Priority, done: WriteDone) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.fail_writes) {
            self.complete(move || done(data, Err(io::Error::other("injected write failure"))));
            return;
        }
        let mut id = *id;
        if id.location == [0, 0] {
            let loc = self.next.fetch_add(1, Ordering::Relaxed);
            id.location = [0, loc];
        }
        if id.birth == 0 {
            id.birth = self.next.fetch_add(1, Ordering::Relaxed);
        }
        self.blocks.lock().insert(id, data.clone());
        self.complete(move || done(data, Ok(id)));
    }
}

/// In-memory secondary device with fault injection.
#[derive(Debug)]
pub struct MemoryDevice {
    bytes: RwLock<Vec<u8>>,
    alignment: u64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
}

impl MemoryDevice {
    /// Creates a zeroed device of `capacity` bytes.
    pub fn new(capacity: u64, alignment: u64) -> Self {
        MemoryDevice {
            bytes: RwLock::new(vec![0; capacity as usize]),
            alignment: alignment.max(1),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    /// Flips every byte in `offset..offset + len`.
    pub fn corrupt(&self, offset: u64, len: u64) {
        let mut bytes = self.bytes.write();
        let end = offset.saturating_add(len).min(bytes.len() as u64) as usize;
        let start = (offset as usize).min(end);
        for b in &mut bytes[start..end] {
            *b = !*b;
        }
    }

    /// Makes every read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Reads served so far, failed ones included.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<core::ops::Range<usize>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.capacity())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "beyond device end"))?;
        Ok(offset as usize..end as usize)
    }
}

impl SecondaryDevice for MemoryDevice {
    fn capacity(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn alignment(&self) -> u64 {
        self.alignment
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected device read failure"));
        }
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.read()[range]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected device write failure"));
        }
        let range = self.range(offset, data.len())?;
        self.bytes.write()[range].copy_from_slice(data);
        Ok(())
    }
}

/// File-backed secondary device using positional reads and writes.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    len: u64,
    alignment: u64,
}

#[cfg(unix)]
impl FileDevice {
    /// Opens (creating if needed) `path` and sizes it to `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(FileDevice {
            file: Arc::new(file),
            len,
            alignment: 4096,
        })
    }

    fn check(&self, offset: u64, len: usize) -> io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {offset}+{len} beyond device length {}", self.len),
            )),
        }
    }
}

#[cfg(unix)]
impl SecondaryDevice for FileDevice {
    fn capacity(&self) -> u64 {
        self.len
    }

    fn alignment(&self) -> u64 {
        self.alignment
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.check(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.check(offset, data.len())?;
        self.file.write_all_at(data, offset)
    }
}
