//! Shared machinery of the persistent space maps.
//!
//! Counts are stored two bits per block in *bitmap blocks*:
//!
//! - `0`, `1`, `2` — the count itself;
//! - `3` — the count is 3 or more and lives in the overflow B-tree, keyed
//!   by block address.
//!
//! A bitmap block is a 16-byte header (csum, padding, blocknr) followed by
//! packed entries, so one 4 KiB block covers 16320 device blocks. An
//! [`IndexEntry`] per bitmap records where the bitmap currently lives plus
//! two allocation hints. The index itself is stored one of two ways: the
//! metadata variant packs all entries into a single index block (capping the
//! device at 255 bitmaps), the disk variant keeps them in a B-tree keyed by
//! bitmap number.
//!
//! Everything above reopens from [`SmRoot`], a 32-byte record the caller
//! stores wherever it keeps its superblock.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use thinmeta_block::{BlockAddress, BlockBuf, BLOCK_SIZE};
use thinmeta_error::{MetaError, Result};
use tracing::trace;

use crate::btree::{Btree, Pack};
use crate::checksum::{self, BITMAP_CSUM_XOR, INDEX_CSUM_XOR};
use crate::txn::TransactionManager;

/// Bitmap block header: csum (4), padding (4), blocknr (8).
const BITMAP_HDR_SIZE: usize = 16;

/// Device blocks covered by one bitmap block, at 4 entries per byte.
pub const ENTRIES_PER_BITMAP: u64 = ((BLOCK_SIZE - BITMAP_HDR_SIZE) * 4) as u64;

/// Index-block capacity; caps the metadata variant's device size.
pub const MAX_METADATA_BITMAPS: usize = (BLOCK_SIZE - BITMAP_HDR_SIZE) / IndexEntry::SIZE;

/// Largest root record any persistent map will produce.
pub const MAX_ROOT_SIZE: usize = 128;

/// Bitmap commit passes allowed before concluding the index will never
/// stabilise.
const MAX_COMMIT_PASSES: u32 = 16;

fn bitmap_get(data: &[u8], bit: usize) -> u8 {
    (data[BITMAP_HDR_SIZE + bit / 4] >> ((bit % 4) * 2)) & 3
}

fn bitmap_set(data: &mut [u8], bit: usize, val: u8) {
    let byte = &mut data[BITMAP_HDR_SIZE + bit / 4];
    let shift = (bit % 4) * 2;
    *byte = (*byte & !(3 << shift)) | (val << shift);
}

/// Where a bitmap block lives, plus allocation hints.
///
/// `none_free_before` is a lower bound on the first free entry: every entry
/// below it is known to be allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub blocknr: BlockAddress,
    pub nr_free: u32,
    pub none_free_before: u32,
}

impl Pack for IndexEntry {
    const SIZE: usize = 16;

    fn pack(&self, out: &mut [u8]) {
        self.blocknr.pack(&mut out[0..8]);
        self.nr_free.pack(&mut out[8..12]);
        self.none_free_before.pack(&mut out[12..16]);
    }

    fn unpack(data: &[u8]) -> Self {
        Self {
            blocknr: u64::unpack(&data[0..8]),
            nr_free: u32::unpack(&data[8..12]),
            none_free_before: u32::unpack(&data[12..16]),
        }
    }
}

/// Reopenable root record of a persistent space map. 32 bytes packed,
/// little endian, in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    /// Index block address (metadata variant) or index B-tree root (disk).
    pub bitmap_root: BlockAddress,
    /// Overflow B-tree root.
    pub ref_count_root: BlockAddress,
}

impl SmRoot {
    pub const SIZE: usize = 32;

    pub fn pack(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() < Self::SIZE {
            return Err(MetaError::BufferTooSmall {
                needed: Self::SIZE,
                capacity: out.len(),
            });
        }
        self.nr_blocks.pack(&mut out[0..8]);
        self.nr_allocated.pack(&mut out[8..16]);
        self.bitmap_root.pack(&mut out[16..24]);
        self.ref_count_root.pack(&mut out[24..32]);
        Ok(Self::SIZE)
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            // Root bytes live in the caller's superblock, block 0.
            return Err(MetaError::Corrupt {
                block: 0,
                detail: format!(
                    "space map root needs {} bytes, got {}",
                    Self::SIZE,
                    data.len()
                ),
            });
        }
        Ok(Self {
            nr_blocks: u64::unpack(&data[0..8]),
            nr_allocated: u64::unpack(&data[8..16]),
            bitmap_root: u64::unpack(&data[16..24]),
            ref_count_root: u64::unpack(&data[24..32]),
        })
    }
}

/// How the index entries are persisted.
pub(crate) enum IndexStore {
    /// A single index block holding every entry.
    Metadata(Cell<BlockAddress>),
    /// A B-tree keyed by bitmap number.
    Tree(Btree<IndexEntry>),
}

/// The common core of the disk and metadata space maps.
///
/// Mutations write bitmap blocks immediately (through copy-on-write
/// shadows); the index entries are held in memory and persisted by
/// [`SmLowLevel::commit`]. When this map also serves as the transaction
/// manager's allocator, every shadow taken here re-enters the map; the
/// recursive decorator above us turns those re-entries into deferred work,
/// which is why each operation here leaves the map readable before it
/// touches the overflow tree.
pub struct SmLowLevel {
    tm: Rc<TransactionManager>,
    nr_blocks: u64,
    nr_allocated: Cell<u64>,
    cursor: Cell<BlockAddress>,
    overflow: Btree<u32>,
    index: RefCell<Vec<IndexEntry>>,
    dirty: RefCell<BTreeSet<usize>>,
    store: IndexStore,
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn pack_index_block(addr: BlockAddress, entries: &[IndexEntry]) -> BlockBuf {
    let mut buf = BlockBuf::zeroed();
    {
        let data = buf.as_mut_slice();
        addr.pack(&mut data[8..16]);
        for (i, e) in entries.iter().enumerate() {
            let off = BITMAP_HDR_SIZE + i * IndexEntry::SIZE;
            e.pack(&mut data[off..off + IndexEntry::SIZE]);
        }
        checksum::stamp(data, INDEX_CSUM_XOR);
    }
    buf
}

impl SmLowLevel {
    fn nr_bitmaps(&self) -> usize {
        div_ceil(self.nr_blocks, ENTRIES_PER_BITMAP) as usize
    }

    /// Entries actually backed by the device in bitmap `i` (the last bitmap
    /// is usually partial).
    fn entries_in(&self, i: usize) -> usize {
        let begin = i as u64 * ENTRIES_PER_BITMAP;
        (self.nr_blocks - begin).min(ENTRIES_PER_BITMAP) as usize
    }

    fn create(
        tm: Rc<TransactionManager>,
        nr_blocks: u64,
        metadata_index: bool,
    ) -> Result<Self> {
        let nr_bitmaps = div_ceil(nr_blocks, ENTRIES_PER_BITMAP) as usize;
        if nr_blocks == 0 {
            return Err(MetaError::Format("space map over zero blocks".into()));
        }
        if metadata_index && nr_bitmaps > MAX_METADATA_BITMAPS {
            return Err(MetaError::Format(format!(
                "{nr_blocks} blocks needs {nr_bitmaps} bitmaps, index block holds {MAX_METADATA_BITMAPS}"
            )));
        }

        let overflow = Btree::create(tm.clone())?;

        let mut entries = Vec::with_capacity(nr_bitmaps);
        for i in 0..nr_bitmaps {
            let b = tm.new_block()?;
            let mut buf = BlockBuf::zeroed();
            {
                let data = buf.as_mut_slice();
                b.pack(&mut data[8..16]);
                checksum::stamp(data, BITMAP_CSUM_XOR);
            }
            tm.write(b, &buf)?;
            let begin = i as u64 * ENTRIES_PER_BITMAP;
            entries.push(IndexEntry {
                blocknr: b,
                nr_free: (nr_blocks - begin).min(ENTRIES_PER_BITMAP) as u32,
                none_free_before: 0,
            });
        }

        let store = if metadata_index {
            let ib = tm.new_block()?;
            tm.write(ib, &pack_index_block(ib, &entries))?;
            IndexStore::Metadata(Cell::new(ib))
        } else {
            let tree = Btree::create(tm.clone())?;
            for (i, e) in entries.iter().enumerate() {
                tree.insert(i as u64, *e)?;
            }
            IndexStore::Tree(tree)
        };

        trace!(nr_blocks, nr_bitmaps, "created persistent space map");
        Ok(Self {
            tm,
            nr_blocks,
            nr_allocated: Cell::new(0),
            cursor: Cell::new(0),
            overflow,
            index: RefCell::new(entries),
            dirty: RefCell::new(BTreeSet::new()),
            store,
        })
    }

    pub(crate) fn create_metadata(tm: Rc<TransactionManager>, nr_blocks: u64) -> Result<Self> {
        Self::create(tm, nr_blocks, true)
    }

    pub(crate) fn create_disk(tm: Rc<TransactionManager>, nr_blocks: u64) -> Result<Self> {
        Self::create(tm, nr_blocks, false)
    }

    fn open(tm: Rc<TransactionManager>, root: &SmRoot, metadata_index: bool) -> Result<Self> {
        let nr_bitmaps = div_ceil(root.nr_blocks, ENTRIES_PER_BITMAP) as usize;
        if root.nr_blocks == 0 {
            return Err(MetaError::Corrupt {
                block: 0,
                detail: "space map root with zero blocks".into(),
            });
        }

        let overflow = Btree::open(tm.clone(), root.ref_count_root)?;

        let (entries, store) = if metadata_index {
            if nr_bitmaps > MAX_METADATA_BITMAPS {
                return Err(MetaError::Corrupt {
                    block: root.bitmap_root,
                    detail: format!(
                        "root claims {nr_bitmaps} bitmaps, index block holds {MAX_METADATA_BITMAPS}"
                    ),
                });
            }
            let buf = tm.read(root.bitmap_root)?;
            let data = buf.as_slice();
            if !checksum::verify(data, INDEX_CSUM_XOR) {
                return Err(MetaError::Corrupt {
                    block: root.bitmap_root,
                    detail: "index block checksum mismatch".into(),
                });
            }
            if u64::unpack(&data[8..16]) != root.bitmap_root {
                return Err(MetaError::Corrupt {
                    block: root.bitmap_root,
                    detail: "index block claims another address".into(),
                });
            }
            let mut entries = Vec::with_capacity(nr_bitmaps);
            for i in 0..nr_bitmaps {
                let off = BITMAP_HDR_SIZE + i * IndexEntry::SIZE;
                entries.push(IndexEntry::unpack(&data[off..off + IndexEntry::SIZE]));
            }
            (entries, IndexStore::Metadata(Cell::new(root.bitmap_root)))
        } else {
            let tree: Btree<IndexEntry> = Btree::open(tm.clone(), root.bitmap_root)?;
            let mut entries = Vec::with_capacity(nr_bitmaps);
            for i in 0..nr_bitmaps {
                let e = tree.lookup(i as u64)?.ok_or_else(|| MetaError::Corrupt {
                    block: root.bitmap_root,
                    detail: format!("missing index entry for bitmap {i}"),
                })?;
                entries.push(e);
            }
            (entries, IndexStore::Tree(tree))
        };

        let sm = Self {
            tm,
            nr_blocks: root.nr_blocks,
            nr_allocated: Cell::new(root.nr_allocated),
            cursor: Cell::new(0),
            overflow,
            index: RefCell::new(entries),
            dirty: RefCell::new(BTreeSet::new()),
            store,
        };

        // Eager validation: every bitmap block must checksum clean and the
        // hints must be plausible.
        for i in 0..nr_bitmaps {
            let e = sm.index.borrow()[i];
            if e.nr_free as usize > sm.entries_in(i) {
                return Err(MetaError::Corrupt {
                    block: e.blocknr,
                    detail: format!("bitmap {i} claims {} free entries", e.nr_free),
                });
            }
            sm.read_bitmap(&e)?;
        }
        Ok(sm)
    }

    pub(crate) fn open_metadata(tm: Rc<TransactionManager>, root: &SmRoot) -> Result<Self> {
        Self::open(tm, root, true)
    }

    pub(crate) fn open_disk(tm: Rc<TransactionManager>, root: &SmRoot) -> Result<Self> {
        Self::open(tm, root, false)
    }

    fn check(&self, b: BlockAddress) -> Result<()> {
        if b < self.nr_blocks {
            Ok(())
        } else {
            Err(MetaError::OutOfRange {
                block: b,
                nr_blocks: self.nr_blocks,
            })
        }
    }

    fn read_bitmap(&self, e: &IndexEntry) -> Result<BlockBuf> {
        let buf = self.tm.read(e.blocknr)?;
        let data = buf.as_slice();
        if !checksum::verify(data, BITMAP_CSUM_XOR) {
            return Err(MetaError::Corrupt {
                block: e.blocknr,
                detail: "bitmap block checksum mismatch".into(),
            });
        }
        if u64::unpack(&data[8..16]) != e.blocknr {
            return Err(MetaError::Corrupt {
                block: e.blocknr,
                detail: "bitmap block claims another address".into(),
            });
        }
        Ok(buf)
    }

    /// The count-changing core. `old` is the current count; callers have
    /// already short-circuited `old == count`.
    ///
    /// Ordering matters when this map is its own allocator: the bitmap write
    /// and the index entry update complete before the overflow tree is
    /// touched, so the map stays readable by the nested allocations the tree
    /// operations make.
    fn set_count_raw(&self, b: BlockAddress, old: u32, count: u32) -> Result<()> {
        let bitmap = (b / ENTRIES_PER_BITMAP) as usize;
        let bit = (b % ENTRIES_PER_BITMAP) as usize;
        let entry = self.index.borrow()[bitmap];

        let (addr, _moved) = self.tm.shadow(entry.blocknr)?;
        let mut buf = self.tm.read(addr)?;
        {
            let data = buf.as_mut_slice();
            if !checksum::verify(data, BITMAP_CSUM_XOR) {
                return Err(MetaError::Corrupt {
                    block: entry.blocknr,
                    detail: "bitmap block checksum mismatch".into(),
                });
            }
            // A moved shadow still carries the old address until restamped.
            if u64::unpack(&data[8..16]) != entry.blocknr {
                return Err(MetaError::Corrupt {
                    block: entry.blocknr,
                    detail: "bitmap block claims another address".into(),
                });
            }
            addr.pack(&mut data[8..16]);
            bitmap_set(data, bit, count.min(3) as u8);
            checksum::stamp(data, BITMAP_CSUM_XOR);
        }
        self.tm.write(addr, &buf)?;

        {
            let mut index = self.index.borrow_mut();
            let e = &mut index[bitmap];
            e.blocknr = addr;
            if old == 0 && count > 0 {
                e.nr_free -= 1;
                if e.none_free_before == bit as u32 {
                    e.none_free_before += 1;
                }
                self.nr_allocated.set(self.nr_allocated.get() + 1);
            } else if old > 0 && count == 0 {
                e.nr_free += 1;
                e.none_free_before = e.none_free_before.min(bit as u32);
                self.nr_allocated.set(self.nr_allocated.get() - 1);
            }
        }
        self.dirty.borrow_mut().insert(bitmap);

        if count >= 3 {
            self.overflow.insert(b, count)?;
        } else if old >= 3 {
            self.overflow.remove(b)?;
        }
        Ok(())
    }
}

impl super::SpaceMap for SmLowLevel {
    fn get_nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    fn get_nr_free(&self) -> u64 {
        self.nr_blocks - self.nr_allocated.get()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        self.check(b)?;
        let bitmap = (b / ENTRIES_PER_BITMAP) as usize;
        let bit = (b % ENTRIES_PER_BITMAP) as usize;
        let entry = self.index.borrow()[bitmap];
        let buf = self.read_bitmap(&entry)?;
        match bitmap_get(buf.as_slice(), bit) {
            v @ 0..=2 => Ok(u32::from(v)),
            _ => self.overflow.lookup(b)?.ok_or(MetaError::Corrupt {
                block: entry.blocknr,
                detail: format!("block {b} marked overflow but has no tree entry"),
            }),
        }
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        self.check(b)?;
        let old = self.get_count(b)?;
        if old == count {
            return Ok(());
        }
        self.set_count_raw(b, old, count)
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        let old = self.get_count(b)?;
        self.set_count_raw(b, old, old + 1)
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        let old = self.get_count(b)?;
        if old == 0 {
            return Err(MetaError::Underflow { block: b });
        }
        self.set_count_raw(b, old, old - 1)
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        let found = match self.find_free(self.cursor.get())? {
            Some(b) => Some(b),
            None => self.find_free(0)?,
        };
        match found {
            Some(b) => {
                self.set_count_raw(b, 0, 1)?;
                self.cursor.set(b + 1);
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    /// First free block at or after `begin`; does not wrap.
    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        if begin >= self.nr_blocks {
            return Ok(None);
        }
        let first_bitmap = (begin / ENTRIES_PER_BITMAP) as usize;
        for i in first_bitmap..self.nr_bitmaps() {
            let entry = self.index.borrow()[i];
            if entry.nr_free == 0 {
                continue;
            }
            let mut first = if i == first_bitmap {
                (begin % ENTRIES_PER_BITMAP) as usize
            } else {
                0
            };
            first = first.max(entry.none_free_before as usize);
            let limit = self.entries_in(i);
            if first >= limit {
                continue;
            }
            let buf = self.read_bitmap(&entry)?;
            let data = buf.as_slice();
            for bit in first..limit {
                if bitmap_get(data, bit) == 0 {
                    return Ok(Some(i as u64 * ENTRIES_PER_BITMAP + bit as u64));
                }
            }
        }
        Ok(None)
    }

    /// Persist the in-memory index entries.
    ///
    /// Writing the index may itself allocate (shadowing the index block or
    /// inserting into the index tree), which dirties more entries; loop
    /// until a pass generates no new work. Shadows are in place after the
    /// first copy, so this settles within a few passes.
    fn commit(&self) -> Result<()> {
        let mut passes = 0;
        while !self.dirty.borrow().is_empty() {
            passes += 1;
            if passes > MAX_COMMIT_PASSES {
                return Err(MetaError::RecursionLimit {
                    passes: MAX_COMMIT_PASSES,
                });
            }
            let dirty: Vec<usize> = {
                let mut d = self.dirty.borrow_mut();
                let v: Vec<usize> = d.iter().copied().collect();
                d.clear();
                v
            };
            match &self.store {
                IndexStore::Metadata(cell) => {
                    // Shadow first: the shadow's own allocation mutates
                    // entries, and the snapshot below must include that.
                    let (addr, _) = self.tm.shadow(cell.get())?;
                    cell.set(addr);
                    let entries: Vec<IndexEntry> = self.index.borrow().clone();
                    self.tm.write(addr, &pack_index_block(addr, &entries))?;
                }
                IndexStore::Tree(tree) => {
                    for i in dirty {
                        let e = self.index.borrow()[i];
                        tree.insert(i as u64, e)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl super::PersistentSpaceMap for SmLowLevel {
    fn root_size(&self) -> usize {
        SmRoot::SIZE
    }

    fn copy_root(&self, out: &mut [u8]) -> Result<usize> {
        let root = SmRoot {
            nr_blocks: self.nr_blocks,
            nr_allocated: self.nr_allocated.get(),
            bitmap_root: match &self.store {
                IndexStore::Metadata(cell) => cell.get(),
                IndexStore::Tree(tree) => tree.root(),
            },
            ref_count_root: self.overflow.root(),
        };
        root.pack(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_entry_packing() {
        let mut data = vec![0_u8; BLOCK_SIZE];
        bitmap_set(&mut data, 0, 3);
        bitmap_set(&mut data, 1, 1);
        bitmap_set(&mut data, 5, 2);
        bitmap_set(&mut data, 16319, 3);
        assert_eq!(bitmap_get(&data, 0), 3);
        assert_eq!(bitmap_get(&data, 1), 1);
        assert_eq!(bitmap_get(&data, 2), 0);
        assert_eq!(bitmap_get(&data, 5), 2);
        assert_eq!(bitmap_get(&data, 16319), 3);

        // Overwriting clears the old value.
        bitmap_set(&mut data, 0, 1);
        assert_eq!(bitmap_get(&data, 0), 1);
        assert_eq!(bitmap_get(&data, 1), 1);
    }

    #[test]
    fn geometry() {
        assert_eq!(ENTRIES_PER_BITMAP, 16320);
        assert_eq!(MAX_METADATA_BITMAPS, 255);
    }

    #[test]
    fn index_entry_roundtrip() {
        let e = IndexEntry {
            blocknr: 0xdead_beef,
            nr_free: 1234,
            none_free_before: 99,
        };
        let mut raw = [0_u8; IndexEntry::SIZE];
        e.pack(&mut raw);
        assert_eq!(IndexEntry::unpack(&raw), e);
    }

    #[test]
    fn root_roundtrip_and_bounds() {
        let root = SmRoot {
            nr_blocks: 1000,
            nr_allocated: 42,
            bitmap_root: 7,
            ref_count_root: 9,
        };
        let mut raw = [0_u8; MAX_ROOT_SIZE];
        let n = root.pack(&mut raw).unwrap();
        assert_eq!(n, SmRoot::SIZE);
        assert!(n <= MAX_ROOT_SIZE);
        assert_eq!(SmRoot::unpack(&raw).unwrap(), root);

        let mut tiny = [0_u8; 16];
        assert!(matches!(
            root.pack(&mut tiny),
            Err(MetaError::BufferTooSmall { needed: 32, capacity: 16 })
        ));
        assert!(matches!(
            SmRoot::unpack(&tiny),
            Err(MetaError::Corrupt { .. })
        ));
    }
}
