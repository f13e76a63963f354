#![forbid(unsafe_code)]
//! Fixed-size block I/O.
//!
//! Provides the `BlockIo` trait with in-memory and file backings, and
//! `BlockManager`, which adds range validation and a bounded write-through
//! cache. The cache capacity is the subsystem's working-set bound: only a
//! fixed small number of blocks is resident at once, regardless of how large
//! the backing store is.
//!
//! All metadata structures in this workspace use 4 KiB blocks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use thinmeta_error::{MetaError, Result};

/// Address of a block within a backing store.
pub type BlockAddress = u64;

/// Size of every metadata block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Default number of blocks the manager keeps resident.
pub const MAX_HELD_BLOCKS: usize = 16;

/// Owned block buffer.
///
/// Invariant: length == `BLOCK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    /// A zero-filled block.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK_SIZE],
        }
    }

    /// Wrap an existing buffer. Fails unless it is exactly one block long.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return Err(MetaError::Format(format!(
                "block buffer has {} bytes, expected {BLOCK_SIZE}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Block-addressed backing store.
pub trait BlockIo: Send + Sync + std::fmt::Debug {
    /// Total number of blocks.
    fn nr_blocks(&self) -> u64;

    /// Read block `b` into `buf` (`buf.len()` == `BLOCK_SIZE`).
    fn read(&self, b: BlockAddress, buf: &mut [u8]) -> Result<()>;

    /// Write block `b` from `buf` (`buf.len()` == `BLOCK_SIZE`).
    fn write(&self, b: BlockAddress, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Memory-backed store for tests and transient maps.
#[derive(Debug)]
pub struct MemoryIo {
    nr_blocks: u64,
    data: Mutex<Vec<u8>>,
}

impl MemoryIo {
    pub fn new(nr_blocks: u64) -> Result<Self> {
        let len = usize::try_from(nr_blocks)
            .ok()
            .and_then(|n| n.checked_mul(BLOCK_SIZE))
            .ok_or_else(|| MetaError::Format(format!("nr_blocks {nr_blocks} overflows memory")))?;
        Ok(Self {
            nr_blocks,
            data: Mutex::new(vec![0_u8; len]),
        })
    }

    fn offset(&self, b: BlockAddress) -> Result<usize> {
        if b >= self.nr_blocks {
            return Err(MetaError::OutOfRange {
                block: b,
                nr_blocks: self.nr_blocks,
            });
        }
        // nr_blocks * BLOCK_SIZE fit a usize at construction time.
        let idx = usize::try_from(b).map_err(|_| MetaError::OutOfRange {
            block: b,
            nr_blocks: self.nr_blocks,
        })?;
        Ok(idx * BLOCK_SIZE)
    }
}

impl BlockIo for MemoryIo {
    fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    fn read(&self, b: BlockAddress, buf: &mut [u8]) -> Result<()> {
        let off = self.offset(b)?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn write(&self, b: BlockAddress, buf: &[u8]) -> Result<()> {
        let off = self.offset(b)?;
        let mut data = self.data.lock();
        data[off..off + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed store using positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position. Falls back to read-only when the file cannot be opened for
/// writing; writes then fail with `ReadOnly`.
#[derive(Debug)]
pub struct FileIo {
    file: Arc<File>,
    nr_blocks: u64,
    writable: bool,
}

impl FileIo {
    /// Open an existing image. The file length must be block-aligned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_size = BLOCK_SIZE as u64;
        if len % block_size != 0 {
            return Err(MetaError::Format(format!(
                "image length {len} is not a multiple of {BLOCK_SIZE}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            nr_blocks: len / block_size,
            writable,
        })
    }

    /// Create (or truncate) an image with `nr_blocks` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, nr_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let len = nr_blocks
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or_else(|| {
                MetaError::Format(format!("nr_blocks {nr_blocks} overflows device size"))
            })?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            nr_blocks,
            writable: true,
        })
    }

    fn check_range(&self, b: BlockAddress) -> Result<u64> {
        if b >= self.nr_blocks {
            return Err(MetaError::OutOfRange {
                block: b,
                nr_blocks: self.nr_blocks,
            });
        }
        Ok(b * BLOCK_SIZE as u64)
    }
}

impl BlockIo for FileIo {
    fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    fn read(&self, b: BlockAddress, buf: &mut [u8]) -> Result<()> {
        let off = self.check_range(b)?;
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    fn write(&self, b: BlockAddress, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MetaError::ReadOnly);
        }
        let off = self.check_range(b)?;
        self.file.write_all_at(buf, off)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug)]
struct CacheState {
    /// Resident blocks, value cloned out on hit.
    blocks: HashMap<BlockAddress, Vec<u8>>,
    /// FIFO eviction order; membership mirrors `blocks`.
    order: VecDeque<BlockAddress>,
}

/// Validating block store with a bounded write-through cache.
#[derive(Debug)]
pub struct BlockManager {
    io: Arc<dyn BlockIo>,
    capacity: usize,
    cache: Mutex<CacheState>,
}

impl BlockManager {
    #[must_use]
    pub fn new(io: Arc<dyn BlockIo>) -> Self {
        Self::with_capacity(io, MAX_HELD_BLOCKS)
    }

    #[must_use]
    pub fn with_capacity(io: Arc<dyn BlockIo>, capacity: usize) -> Self {
        Self {
            io,
            capacity: capacity.max(1),
            cache: Mutex::new(CacheState {
                blocks: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.io.nr_blocks()
    }

    fn check_range(&self, b: BlockAddress) -> Result<()> {
        let nr = self.io.nr_blocks();
        if b >= nr {
            return Err(MetaError::OutOfRange {
                block: b,
                nr_blocks: nr,
            });
        }
        Ok(())
    }

    fn insert_cached(&self, state: &mut CacheState, b: BlockAddress, bytes: Vec<u8>) {
        if state.blocks.insert(b, bytes).is_none() {
            state.order.push_back(b);
        }
        while state.blocks.len() > self.capacity {
            if let Some(victim) = state.order.pop_front() {
                state.blocks.remove(&victim);
            } else {
                break;
            }
        }
    }

    /// Read block `b`.
    pub fn read(&self, b: BlockAddress) -> Result<BlockBuf> {
        self.check_range(b)?;
        {
            let state = self.cache.lock();
            if let Some(bytes) = state.blocks.get(&b) {
                return BlockBuf::new(bytes.clone());
            }
        }
        let mut buf = BlockBuf::zeroed();
        self.io.read(b, buf.as_mut_slice())?;
        let mut state = self.cache.lock();
        self.insert_cached(&mut state, b, buf.as_slice().to_vec());
        Ok(buf)
    }

    /// Write block `b` (write-through).
    pub fn write(&self, b: BlockAddress, buf: &BlockBuf) -> Result<()> {
        self.check_range(b)?;
        self.io.write(b, buf.as_slice())?;
        let mut state = self.cache.lock();
        self.insert_cached(&mut state, b, buf.as_slice().to_vec());
        Ok(())
    }

    /// Flush the backing store.
    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }
}
