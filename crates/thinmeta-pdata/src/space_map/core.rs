//! In-memory space map.
//!
//! Keeps a full `u32` count per block in a `Vec`. Used as the allocator
//! during metadata bootstrap, and as the oracle the persistent maps are
//! tested against.

use std::cell::{Cell, RefCell};
use thinmeta_block::BlockAddress;
use thinmeta_error::{MetaError, Result};

use super::SpaceMap;

pub struct CoreSpaceMap {
    counts: RefCell<Vec<u32>>,
    nr_free: Cell<u64>,
    // Next-fit allocation cursor.
    cursor: Cell<u64>,
}

impl CoreSpaceMap {
    #[must_use]
    pub fn new(nr_blocks: u64) -> Self {
        Self {
            counts: RefCell::new(vec![0; nr_blocks as usize]),
            nr_free: Cell::new(nr_blocks),
            cursor: Cell::new(0),
        }
    }

    fn check(&self, b: BlockAddress) -> Result<usize> {
        let nr_blocks = self.counts.borrow().len() as u64;
        if b < nr_blocks {
            Ok(b as usize)
        } else {
            Err(MetaError::OutOfRange { block: b, nr_blocks })
        }
    }
}

impl SpaceMap for CoreSpaceMap {
    fn get_nr_blocks(&self) -> u64 {
        self.counts.borrow().len() as u64
    }

    fn get_nr_free(&self) -> u64 {
        self.nr_free.get()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        let i = self.check(b)?;
        Ok(self.counts.borrow()[i])
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        let i = self.check(b)?;
        let mut counts = self.counts.borrow_mut();
        let old = counts[i];
        counts[i] = count;
        if old == 0 && count > 0 {
            self.nr_free.set(self.nr_free.get() - 1);
        } else if old > 0 && count == 0 {
            self.nr_free.set(self.nr_free.get() + 1);
        }
        Ok(())
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        let old = self.get_count(b)?;
        self.set_count(b, old + 1)
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        let old = self.get_count(b)?;
        if old == 0 {
            return Err(MetaError::Underflow { block: b });
        }
        self.set_count(b, old - 1)
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        match self.find_free(self.cursor.get())? {
            Some(b) => {
                self.set_count(b, 1)?;
                self.cursor.set(b + 1);
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        let counts = self.counts.borrow();
        let nr_blocks = counts.len() as u64;
        let begin = begin.min(nr_blocks);
        for b in (begin..nr_blocks).chain(0..begin) {
            if counts[b as usize] == 0 {
                return Ok(Some(b));
            }
        }
        Ok(None)
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fresh_map_is_all_free() {
        let sm = CoreSpaceMap::new(100);
        assert_eq!(sm.get_nr_blocks(), 100);
        assert_eq!(sm.get_nr_free(), 100);
        assert_eq!(sm.get_nr_allocated(), 0);
        assert_eq!(sm.get_count(0).unwrap(), 0);
    }

    #[test]
    fn out_of_range_rejected() {
        let sm = CoreSpaceMap::new(10);
        assert!(matches!(
            sm.get_count(10),
            Err(MetaError::OutOfRange { block: 10, nr_blocks: 10 })
        ));
        assert!(sm.inc(10).is_err());
        assert!(sm.set_count(11, 1).is_err());
    }

    #[test]
    fn dec_of_free_block_underflows() {
        let sm = CoreSpaceMap::new(10);
        assert!(matches!(sm.dec(3), Err(MetaError::Underflow { block: 3 })));
    }

    #[test]
    fn allocation_wraps_past_the_cursor() {
        let sm = CoreSpaceMap::new(4);
        for _ in 0..4 {
            sm.new_block().unwrap().unwrap();
        }
        assert_eq!(sm.new_block().unwrap(), None);

        // Free an early block; the cursor is past it but allocation wraps.
        sm.dec(1).unwrap();
        assert_eq!(sm.new_block().unwrap(), Some(1));
    }

    #[test]
    fn find_free_is_read_only() {
        let sm = CoreSpaceMap::new(8);
        sm.set_count(0, 1).unwrap();
        assert_eq!(sm.find_free(0).unwrap(), Some(1));
        assert_eq!(sm.find_free(0).unwrap(), Some(1));
        assert_eq!(sm.get_nr_free(), 7);
    }

    proptest! {
        // nr_free always equals the number of zero counts, whatever the
        // interleaving of set/inc/dec/alloc.
        #[test]
        fn nr_free_matches_counts(ops in prop::collection::vec((0_u8..4, 0_u64..32, 0_u32..5), 0..200)) {
            let sm = CoreSpaceMap::new(32);
            for (op, b, c) in ops {
                match op {
                    0 => { let _ = sm.set_count(b, c); }
                    1 => { let _ = sm.inc(b); }
                    2 => { let _ = sm.dec(b); }
                    _ => { let _ = sm.new_block(); }
                }
            }
            let mut zeros = 0;
            for b in 0..32 {
                if sm.get_count(b).unwrap() == 0 {
                    zeros += 1;
                }
            }
            prop_assert_eq!(sm.get_nr_free(), zeros);
            prop_assert_eq!(sm.get_nr_allocated(), 32 - zeros);
        }
    }
}
