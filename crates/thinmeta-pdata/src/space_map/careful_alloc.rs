//! Careful-allocation decorator.
//!
//! Blocks freed during the current transaction still hold data the committed
//! tree may reference; reusing one before commit would make crash recovery
//! impossible. This decorator quarantines, until `commit`, every block that
//! was either allocated this transaction or decremented to zero this
//! transaction, and never hands one out from `new_block` or `find_free`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use thinmeta_block::BlockAddress;
use thinmeta_error::Result;
use tracing::trace;

use super::{PersistentSpaceMap, SpaceMap};

pub struct CarefulAllocSpaceMap<SM> {
    inner: SM,
    pending: RefCell<BTreeSet<BlockAddress>>,
    // Next-fit cursor: allocation resumes past the last grant and only
    // wraps once the tail of the device is exhausted.
    cursor: Cell<BlockAddress>,
}

impl<SM: SpaceMap> CarefulAllocSpaceMap<SM> {
    pub fn new(inner: SM) -> Self {
        Self {
            inner,
            pending: RefCell::new(BTreeSet::new()),
            cursor: Cell::new(0),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &SM {
        &self.inner
    }

    /// First free block at or after `begin` that is not quarantined.
    ///
    /// The inner probe wraps; a wrapped result below `begin` means every
    /// free block has already been examined and found quarantined.
    fn find_clean(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        let nr_blocks = self.inner.get_nr_blocks();
        let mut begin = begin;
        loop {
            match self.inner.find_free(begin)? {
                Some(b) if b < begin => return Ok(None),
                Some(b) if self.pending.borrow().contains(&b) => {
                    begin = b + 1;
                    if begin >= nr_blocks {
                        return Ok(None);
                    }
                }
                other => return Ok(other),
            }
        }
    }
}

impl<SM: SpaceMap> SpaceMap for CarefulAllocSpaceMap<SM> {
    fn get_nr_blocks(&self) -> u64 {
        self.inner.get_nr_blocks()
    }

    fn get_nr_free(&self) -> u64 {
        self.inner.get_nr_free()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        self.inner.get_count(b)
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        self.inner.set_count(b, count)
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        self.inner.inc(b)
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        self.inner.dec(b)?;
        if self.inner.get_count(b)? == 0 {
            trace!(block = b, "quarantined freed block until commit");
            self.pending.borrow_mut().insert(b);
        }
        Ok(())
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        let cursor = self.cursor.get().min(self.inner.get_nr_blocks());
        let found = match self.find_clean(cursor)? {
            Some(b) => Some(b),
            None => self.find_clean(0)?,
        };
        match found {
            Some(b) => {
                self.inner.set_count(b, 1)?;
                self.pending.borrow_mut().insert(b);
                self.cursor.set(b + 1);
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        self.find_clean(begin)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()?;
        self.pending.borrow_mut().clear();
        Ok(())
    }
}

impl<SM: PersistentSpaceMap> PersistentSpaceMap for CarefulAllocSpaceMap<SM> {
    fn root_size(&self) -> usize {
        self.inner.root_size()
    }

    fn copy_root(&self, out: &mut [u8]) -> Result<usize> {
        self.inner.copy_root(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_map::core::CoreSpaceMap;

    #[test]
    fn freed_block_not_reused_before_commit() {
        let sm = CarefulAllocSpaceMap::new(CoreSpaceMap::new(3));
        let a = sm.new_block().unwrap().unwrap();
        let b = sm.new_block().unwrap().unwrap();
        let c = sm.new_block().unwrap().unwrap();
        sm.commit().unwrap();

        sm.dec(b).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 0);
        // The freed block is quarantined, and nothing else is free.
        assert_eq!(sm.new_block().unwrap(), None);

        sm.commit().unwrap();
        assert_eq!(sm.new_block().unwrap(), Some(b));
        let _ = (a, c);
    }

    #[test]
    fn nonzero_after_dec_is_not_quarantined() {
        let sm = CarefulAllocSpaceMap::new(CoreSpaceMap::new(4));
        let b = sm.new_block().unwrap().unwrap();
        sm.inc(b).unwrap();
        sm.commit().unwrap();

        sm.dec(b).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 1);
        // Count is still positive, so it was never free to hand out anyway;
        // the other blocks allocate normally.
        assert!(sm.new_block().unwrap().is_some());
    }

    #[test]
    fn find_free_skips_quarantine() {
        let sm = CarefulAllocSpaceMap::new(CoreSpaceMap::new(4));
        for b in 0..4 {
            sm.set_count(b, 1).unwrap();
        }
        sm.commit().unwrap();
        sm.dec(1).unwrap();
        sm.dec(3).unwrap();
        assert_eq!(sm.find_free(0).unwrap(), None);
        sm.commit().unwrap();
        assert_eq!(sm.find_free(0).unwrap(), Some(1));
        assert_eq!(sm.find_free(2).unwrap(), Some(3));
    }

    #[test]
    fn allocation_resumes_past_the_cursor() {
        let sm = CarefulAllocSpaceMap::new(CoreSpaceMap::new(8));
        assert_eq!(sm.new_block().unwrap(), Some(0));
        assert_eq!(sm.new_block().unwrap(), Some(1));
        sm.commit().unwrap();

        sm.dec(0).unwrap();
        sm.commit().unwrap();
        // Block 0 is free again, but the cursor has moved on; the hole is
        // only revisited after the tail of the device is exhausted.
        assert_eq!(sm.new_block().unwrap(), Some(2));
        for expect in 3..8 {
            assert_eq!(sm.new_block().unwrap(), Some(expect));
        }
        assert_eq!(sm.new_block().unwrap(), Some(0));
        assert_eq!(sm.new_block().unwrap(), None);
    }

    #[test]
    fn fresh_allocations_survive_exhaustion_probe() {
        let sm = CarefulAllocSpaceMap::new(CoreSpaceMap::new(2));
        let a = sm.new_block().unwrap().unwrap();
        let b = sm.new_block().unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(sm.new_block().unwrap(), None);
    }
}
