//! Disk space map: reference counts for a data device.
//!
//! The counted device is not the device the map's own structures live on;
//! those go through the transaction manager the map is given, so no
//! re-entrancy decorators are needed and the index entries are kept in a
//! B-tree rather than a fixed index block (a data device can exceed the 255
//! bitmaps an index block can describe).

use std::rc::Rc;
use thinmeta_block::BlockAddress;
use thinmeta_error::Result;

use super::common::{SmLowLevel, SmRoot};
use super::{PersistentSpaceMap, SpaceMap};
use crate::txn::TransactionManager;

pub struct DiskSpaceMap {
    tm: Rc<TransactionManager>,
    ll: SmLowLevel,
}

/// Create a map for a data device of `nr_blocks`, storing its structures
/// through `tm`.
pub fn create_disk_sm(tm: Rc<TransactionManager>, nr_blocks: u64) -> Result<DiskSpaceMap> {
    let ll = SmLowLevel::create_disk(tm.clone(), nr_blocks)?;
    Ok(DiskSpaceMap { tm, ll })
}

/// Reopen a map from a root record previously produced by `copy_root`.
pub fn open_disk_sm(tm: Rc<TransactionManager>, root: &[u8]) -> Result<DiskSpaceMap> {
    let root = SmRoot::unpack(root)?;
    let ll = SmLowLevel::open_disk(tm.clone(), &root)?;
    Ok(DiskSpaceMap { tm, ll })
}

impl SpaceMap for DiskSpaceMap {
    fn get_nr_blocks(&self) -> u64 {
        self.ll.get_nr_blocks()
    }

    fn get_nr_free(&self) -> u64 {
        self.ll.get_nr_free()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        self.ll.get_count(b)
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        self.ll.set_count(b, count)
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        self.ll.inc(b)
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        self.ll.dec(b)
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        self.ll.new_block()
    }

    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        self.ll.find_free(begin)
    }

    fn commit(&self) -> Result<()> {
        self.ll.commit()?;
        self.tm.commit()
    }
}

impl PersistentSpaceMap for DiskSpaceMap {
    fn root_size(&self) -> usize {
        self.ll.root_size()
    }

    fn copy_root(&self, out: &mut [u8]) -> Result<usize> {
        self.ll.copy_root(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_map::core::CoreSpaceMap;
    use std::sync::Arc;
    use thinmeta_block::{BlockManager, MemoryIo};
    use thinmeta_error::MetaError;

    fn make_tm(nr_meta_blocks: u64) -> Rc<TransactionManager> {
        let io = Arc::new(MemoryIo::new(nr_meta_blocks).unwrap());
        let bm = Arc::new(BlockManager::new(io));
        let sm: Rc<dyn SpaceMap> = Rc::new(CoreSpaceMap::new(nr_meta_blocks));
        TransactionManager::new(bm, sm)
    }

    #[test]
    fn counts_start_at_zero() {
        let sm = create_disk_sm(make_tm(64), 1000).unwrap();
        assert_eq!(sm.get_nr_blocks(), 1000);
        assert_eq!(sm.get_nr_free(), 1000);
        assert_eq!(sm.get_count(999).unwrap(), 0);
        assert!(matches!(
            sm.get_count(1000),
            Err(MetaError::OutOfRange { .. })
        ));
    }

    #[test]
    fn overflow_transitions() {
        let sm = create_disk_sm(make_tm(64), 100).unwrap();
        let b = 17;
        for expected in 1..=5 {
            sm.inc(b).unwrap();
            assert_eq!(sm.get_count(b).unwrap(), expected);
        }
        sm.set_count(b, 10_000).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 10_000);
        // Back below the overflow threshold.
        sm.set_count(b, 2).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 2);
        sm.dec(b).unwrap();
        sm.dec(b).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 0);
        assert!(matches!(sm.dec(b), Err(MetaError::Underflow { block: 17 })));
    }

    #[test]
    fn device_larger_than_one_bitmap() {
        use crate::space_map::common::ENTRIES_PER_BITMAP;
        let nr_blocks = 2 * ENTRIES_PER_BITMAP + 100;
        let sm = create_disk_sm(make_tm(128), nr_blocks).unwrap();
        // One block per bitmap region.
        for b in [5, ENTRIES_PER_BITMAP + 7, 2 * ENTRIES_PER_BITMAP + 99] {
            sm.inc(b).unwrap();
        }
        assert_eq!(sm.get_nr_allocated(), 3);
        assert_eq!(sm.find_free(ENTRIES_PER_BITMAP).unwrap(), Some(ENTRIES_PER_BITMAP));
    }

    #[test]
    fn reopen_from_root() {
        let io = Arc::new(MemoryIo::new(128).unwrap());
        let bm = Arc::new(BlockManager::new(io.clone()));
        let core: Rc<dyn SpaceMap> = Rc::new(CoreSpaceMap::new(128));
        let tm = TransactionManager::new(bm, core);

        let mut root = [0_u8; 32];
        {
            let sm = create_disk_sm(tm.clone(), 500).unwrap();
            sm.set_count(3, 7).unwrap();
            sm.inc(400).unwrap();
            sm.commit().unwrap();
            assert_eq!(sm.copy_root(&mut root).unwrap(), 32);
        }

        let bm2 = Arc::new(BlockManager::new(io));
        let core2: Rc<dyn SpaceMap> = Rc::new(CoreSpaceMap::new(128));
        let tm2 = TransactionManager::new(bm2, core2);
        let sm = open_disk_sm(tm2, &root).unwrap();
        assert_eq!(sm.get_nr_blocks(), 500);
        assert_eq!(sm.get_nr_allocated(), 2);
        assert_eq!(sm.get_count(3).unwrap(), 7);
        assert_eq!(sm.get_count(400).unwrap(), 1);
        assert_eq!(sm.get_count(4).unwrap(), 0);
    }
}
