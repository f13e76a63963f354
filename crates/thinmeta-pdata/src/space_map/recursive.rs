//! Re-entrancy decorator for self-describing space maps.
//!
//! The metadata space map's counts live in blocks the map itself manages.
//! Persisting a count adjustment can shadow a bitmap block or an overflow
//! tree node, which allocates and frees metadata blocks, which adjusts more
//! counts. Left alone that recursion is unbounded and corrupts the map's
//! intermediate state.
//!
//! This decorator flattens the recursion into a work queue:
//!
//! - While an inner operation is on the stack (`depth > 0`), nested `inc`
//!   and `dec` calls are queued instead of applied.
//! - A nested `new_block` must still return a usable address immediately, so
//!   it *reserves* one with the read-only `find_free` probe, queues the
//!   `+1`, and relies on the reservation set to keep the block exclusive
//!   until the queue drains.
//! - After the outermost operation returns, the queue is drained in passes;
//!   each pass may queue more work, so the number of passes is capped and
//!   overflow is reported as `RecursionLimit`. In practice the queue settles
//!   within two or three passes because shadowing is in place after the
//!   first copy in a transaction.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use thinmeta_block::BlockAddress;
use thinmeta_error::{MetaError, Result};
use tracing::trace;

use super::{PersistentSpaceMap, SpaceMap};

/// Drain passes allowed before concluding the queue will never settle.
const MAX_DRAIN_PASSES: u32 = 32;

struct DepthGuard<'a>(&'a Cell<u32>);

impl<'a> DepthGuard<'a> {
    fn new(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

pub struct RecursiveSpaceMap<SM> {
    inner: SM,
    depth: Cell<u32>,
    deferred: RefCell<VecDeque<(BlockAddress, i32)>>,
    // Blocks handed out by a nested `new_block` whose `+1` is still queued.
    reserved: RefCell<BTreeSet<BlockAddress>>,
    hint: Cell<BlockAddress>,
}

impl<SM: SpaceMap> RecursiveSpaceMap<SM> {
    pub fn new(inner: SM) -> Self {
        Self {
            inner,
            depth: Cell::new(0),
            deferred: RefCell::new(VecDeque::new()),
            reserved: RefCell::new(BTreeSet::new()),
            hint: Cell::new(0),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &SM {
        &self.inner
    }

    /// Probe `[begin, end)` for a free, unreserved block.
    fn probe(&self, mut begin: BlockAddress, end: BlockAddress) -> Result<Option<BlockAddress>> {
        while begin < end {
            match self.inner.find_free(begin)? {
                Some(b) if b >= begin && b < end => {
                    if self.reserved.borrow().contains(&b) {
                        begin = b + 1;
                    } else {
                        return Ok(Some(b));
                    }
                }
                // Wrapped or exhausted: nothing free in this window.
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Reserve a free block without touching any count.
    fn reserve(&self) -> Result<Option<BlockAddress>> {
        let nr_blocks = self.inner.get_nr_blocks();
        let hint = self.hint.get().min(nr_blocks);
        let found = match self.probe(hint, nr_blocks)? {
            Some(b) => Some(b),
            None => self.probe(0, hint)?,
        };
        if let Some(b) = found {
            self.reserved.borrow_mut().insert(b);
            self.hint.set(b + 1);
        }
        Ok(found)
    }

    /// Drain the deferred queue. Only runs at the outermost level; each pass
    /// applies the current batch and may generate the next one.
    fn flush(&self) -> Result<()> {
        if self.depth.get() > 0 {
            return Ok(());
        }
        let mut passes = 0;
        while !self.deferred.borrow().is_empty() {
            passes += 1;
            if passes > MAX_DRAIN_PASSES {
                return Err(MetaError::RecursionLimit {
                    passes: MAX_DRAIN_PASSES,
                });
            }
            let batch: Vec<(BlockAddress, i32)> =
                self.deferred.borrow_mut().drain(..).collect();
            trace!(pass = passes, len = batch.len(), "draining deferred count adjustments");
            let _guard = DepthGuard::new(&self.depth);
            for (b, delta) in batch {
                if delta > 0 {
                    self.inner.inc(b)?;
                } else {
                    self.inner.dec(b)?;
                }
            }
        }
        // Every queued `+1` has landed, so reservations are now visible as
        // ordinary allocated blocks.
        self.reserved.borrow_mut().clear();
        Ok(())
    }
}

impl<SM: SpaceMap> SpaceMap for RecursiveSpaceMap<SM> {
    fn get_nr_blocks(&self) -> u64 {
        self.inner.get_nr_blocks()
    }

    fn get_nr_free(&self) -> u64 {
        self.inner.get_nr_free()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        let mut count = i64::from(self.inner.get_count(b)?);
        for &(blk, delta) in self.deferred.borrow().iter() {
            if blk == b {
                count += i64::from(delta);
            }
        }
        u32::try_from(count).map_err(|_| MetaError::Underflow { block: b })
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        {
            let _guard = DepthGuard::new(&self.depth);
            self.inner.set_count(b, count)?;
        }
        self.flush()
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        if self.depth.get() > 0 {
            self.deferred.borrow_mut().push_back((b, 1));
            return Ok(());
        }
        {
            let _guard = DepthGuard::new(&self.depth);
            self.inner.inc(b)?;
        }
        self.flush()
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        if self.depth.get() > 0 {
            self.deferred.borrow_mut().push_back((b, -1));
            return Ok(());
        }
        {
            let _guard = DepthGuard::new(&self.depth);
            self.inner.dec(b)?;
        }
        self.flush()
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        let b = match self.reserve()? {
            Some(b) => b,
            None => return Ok(None),
        };
        if self.depth.get() > 0 {
            // Nested allocation: the reservation keeps the block exclusive;
            // the count lands when the outermost operation drains the queue.
            self.deferred.borrow_mut().push_back((b, 1));
            trace!(block = b, "nested allocation deferred");
            return Ok(Some(b));
        }
        {
            let _guard = DepthGuard::new(&self.depth);
            self.inner.inc(b)?;
        }
        self.flush()?;
        Ok(Some(b))
    }

    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        let nr_blocks = self.inner.get_nr_blocks();
        match self.probe(begin.min(nr_blocks), nr_blocks)? {
            Some(b) => Ok(Some(b)),
            None => self.probe(0, begin.min(nr_blocks)),
        }
    }

    fn commit(&self) -> Result<()> {
        self.flush()?;
        self.inner.commit()
    }
}

impl<SM: PersistentSpaceMap> PersistentSpaceMap for RecursiveSpaceMap<SM> {
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
    use std::rc::Rc;

    /// Core map that re-enters an outer map on `inc`, standing in for a
    /// persistent map whose bookkeeping allocates and adjusts counts.
    struct ProbeSpaceMap {
        inner: CoreSpaceMap,
        outer: RefCell<Option<Rc<dyn SpaceMap>>>,
        // inc(b) re-enters with inc(b + 1) while b + 1 < chain_end.
        chain_end: Cell<BlockAddress>,
        // Each of the next N incs re-enters with a new_block call.
        nested_allocs: Cell<u32>,
    }

    impl ProbeSpaceMap {
        fn new(nr_blocks: u64) -> Self {
            Self {
                inner: CoreSpaceMap::new(nr_blocks),
                outer: RefCell::new(None),
                chain_end: Cell::new(0),
                nested_allocs: Cell::new(0),
            }
        }

        fn outer(&self) -> Rc<dyn SpaceMap> {
            self.outer.borrow().as_ref().unwrap().clone()
        }
    }

    impl SpaceMap for Rc<ProbeSpaceMap> {
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
            self.inner.inc(b)?;
            if b + 1 < self.chain_end.get() {
                self.outer().inc(b + 1)?;
            }
            if self.nested_allocs.get() > 0 {
                self.nested_allocs.set(self.nested_allocs.get() - 1);
                self.outer().new_block()?;
            }
            Ok(())
        }
        fn dec(&self, b: BlockAddress) -> Result<()> {
            self.inner.dec(b)
        }
        fn new_block(&self) -> Result<Option<BlockAddress>> {
            self.inner.new_block()
        }
        fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
            self.inner.find_free(begin)
        }
        fn commit(&self) -> Result<()> {
            self.inner.commit()
        }
    }

    fn make_probe(nr_blocks: u64) -> (Rc<ProbeSpaceMap>, Rc<RecursiveSpaceMap<Rc<ProbeSpaceMap>>>) {
        let probe = Rc::new(ProbeSpaceMap::new(nr_blocks));
        let rsm = Rc::new(RecursiveSpaceMap::new(probe.clone()));
        *probe.outer.borrow_mut() = Some(rsm.clone());
        (probe, rsm)
    }

    #[test]
    fn passthrough_without_recursion() {
        let sm = RecursiveSpaceMap::new(CoreSpaceMap::new(16));
        let b = sm.new_block().unwrap().unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 1);
        sm.inc(b).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 2);
        sm.dec(b).unwrap();
        sm.dec(b).unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 0);
        assert_eq!(sm.get_nr_free(), 16);
    }

    #[test]
    fn nested_incs_are_applied_after_the_outer_one() {
        let (probe, rsm) = make_probe(16);
        probe.chain_end.set(4);
        // inc(0) re-enters with inc(1), which re-enters with inc(2), ...
        rsm.inc(0).unwrap();
        for b in 0..4 {
            assert_eq!(rsm.get_count(b).unwrap(), 1, "block {b}");
        }
        assert_eq!(rsm.get_count(4).unwrap(), 0);
    }

    #[test]
    fn nested_allocation_reserves_a_distinct_block() {
        let (probe, rsm) = make_probe(16);
        probe.nested_allocs.set(1);
        let b = rsm.new_block().unwrap().unwrap();
        // The nested new_block claimed a different block.
        assert_eq!(rsm.get_count(b).unwrap(), 1);
        assert_eq!(rsm.get_nr_allocated(), 2);
    }

    #[test]
    fn nested_count_visible_before_flush_completes() {
        let (probe, rsm) = make_probe(16);
        probe.chain_end.set(2);
        rsm.inc(0).unwrap();
        // A second top-level inc on an already-settled block.
        rsm.inc(1).unwrap();
        assert_eq!(rsm.get_count(1).unwrap(), 2);
    }

    #[test]
    fn unbounded_recursion_is_cut_off() {
        let (probe, rsm) = make_probe(256);
        // Each drained inc queues another, one per pass; the chain is longer
        // than the pass budget.
        probe.chain_end.set(200);
        assert!(matches!(
            rsm.inc(0),
            Err(MetaError::RecursionLimit { .. })
        ));
    }

    #[test]
    fn exhaustion_reports_none_not_error() {
        let sm = RecursiveSpaceMap::new(CoreSpaceMap::new(2));
        assert!(sm.new_block().unwrap().is_some());
        assert!(sm.new_block().unwrap().is_some());
        assert_eq!(sm.new_block().unwrap(), None);
    }
}
