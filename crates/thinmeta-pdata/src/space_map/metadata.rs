//! Metadata space map: counts for the device it is itself stored on.
//!
//! Composition is fixed by construction: the low-level map is wrapped in the
//! careful-alloc decorator (blocks freed this transaction stay quarantined)
//! and then the recursive decorator (nested count adjustments are deferred),
//! and that stack is installed as the transaction manager's allocator.
//!
//! Creation has a chicken-and-egg problem: the map's first structures must
//! be allocated before the map can track anything. A transient in-memory
//! map serves as the bootstrap allocator; once the persistent structures
//! exist, its counts are adopted by sweeping the device until the two maps
//! agree (recording a count can allocate more bootstrap blocks, so one
//! sweep is not necessarily enough), and only then does the stack take over
//! allocation.

use std::rc::Rc;
use std::sync::Arc;
use thinmeta_block::{BlockAddress, BlockManager};
use thinmeta_error::{MetaError, Result};
use tracing::debug;

use super::careful_alloc::CarefulAllocSpaceMap;
use super::common::{SmLowLevel, SmRoot};
use super::core::CoreSpaceMap;
use super::recursive::RecursiveSpaceMap;
use super::{PersistentSpaceMap, SpaceMap};
use crate::txn::TransactionManager;

type Stack = RecursiveSpaceMap<CarefulAllocSpaceMap<SmLowLevel>>;

/// Adoption sweeps allowed before concluding the maps will never agree.
const MAX_ADOPT_PASSES: u32 = 16;

pub struct MetadataSpaceMap {
    tm: Rc<TransactionManager>,
    stack: Rc<Stack>,
}

/// Format a metadata space map covering the whole of `bm`'s device and
/// install it as the allocator of a fresh transaction manager.
pub fn create_metadata_sm(bm: Arc<BlockManager>) -> Result<Rc<MetadataSpaceMap>> {
    let nr_blocks = bm.nr_blocks();
    let boot: Rc<dyn SpaceMap> = Rc::new(CoreSpaceMap::new(nr_blocks));
    let tm = TransactionManager::new(bm, boot.clone());

    let ll = SmLowLevel::create_metadata(tm.clone(), nr_blocks)?;
    let stack = Rc::new(RecursiveSpaceMap::new(CarefulAllocSpaceMap::new(ll)));

    let mut passes = 0;
    loop {
        passes += 1;
        if passes > MAX_ADOPT_PASSES {
            return Err(MetaError::RecursionLimit {
                passes: MAX_ADOPT_PASSES,
            });
        }
        let mut changed = false;
        for b in 0..nr_blocks {
            let want = boot.get_count(b)?;
            if stack.get_count(b)? != want {
                stack.set_count(b, want)?;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    debug!(nr_blocks, passes, allocated = stack.get_nr_allocated(), "metadata space map bootstrapped");

    tm.set_space_map(stack.clone());
    Ok(Rc::new(MetadataSpaceMap { tm, stack }))
}

/// Reopen a metadata space map from a committed root record.
pub fn open_metadata_sm(bm: Arc<BlockManager>, root: &[u8]) -> Result<Rc<MetadataSpaceMap>> {
    let root = SmRoot::unpack(root)?;
    if root.nr_blocks != bm.nr_blocks() {
        return Err(MetaError::Corrupt {
            block: 0,
            detail: format!(
                "root covers {} blocks, device has {}",
                root.nr_blocks,
                bm.nr_blocks()
            ),
        });
    }

    // Placeholder allocator; replaced before anything can allocate.
    let boot: Rc<dyn SpaceMap> = Rc::new(CoreSpaceMap::new(root.nr_blocks));
    let tm = TransactionManager::new(bm, boot);

    let ll = SmLowLevel::open_metadata(tm.clone(), &root)?;
    let stack = Rc::new(RecursiveSpaceMap::new(CarefulAllocSpaceMap::new(ll)));
    tm.set_space_map(stack.clone());
    Ok(Rc::new(MetadataSpaceMap { tm, stack }))
}

impl MetadataSpaceMap {
    /// The transaction manager this map allocates for.
    #[must_use]
    pub fn tm(&self) -> &Rc<TransactionManager> {
        &self.tm
    }
}

impl SpaceMap for MetadataSpaceMap {
    fn get_nr_blocks(&self) -> u64 {
        self.stack.get_nr_blocks()
    }

    fn get_nr_free(&self) -> u64 {
        self.stack.get_nr_free()
    }

    fn get_count(&self, b: BlockAddress) -> Result<u32> {
        self.stack.get_count(b)
    }

    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()> {
        self.stack.set_count(b, count)
    }

    fn inc(&self, b: BlockAddress) -> Result<()> {
        self.stack.inc(b)
    }

    fn dec(&self, b: BlockAddress) -> Result<()> {
        self.stack.dec(b)
    }

    fn new_block(&self) -> Result<Option<BlockAddress>> {
        self.stack.new_block()
    }

    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>> {
        self.stack.find_free(begin)
    }

    /// Flush deferred work, persist the index, and make the transaction
    /// durable. The stack is the transaction manager's allocator, so its
    /// flush happens inside the manager's commit.
    fn commit(&self) -> Result<()> {
        self.tm.commit()
    }
}

impl PersistentSpaceMap for MetadataSpaceMap {
    fn root_size(&self) -> usize {
        self.stack.root_size()
    }

    fn copy_root(&self, out: &mut [u8]) -> Result<usize> {
        self.stack.copy_root(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinmeta_block::MemoryIo;

    fn make_bm(nr_blocks: u64) -> (Arc<MemoryIo>, Arc<BlockManager>) {
        let io = Arc::new(MemoryIo::new(nr_blocks).unwrap());
        let bm = Arc::new(BlockManager::new(io.clone()));
        (io, bm)
    }

    #[test]
    fn accounts_for_its_own_structures() {
        let (_, bm) = make_bm(128);
        let sm = create_metadata_sm(bm).unwrap();

        let allocated = sm.get_nr_allocated();
        // At minimum: a bitmap block, the index block, the overflow root.
        assert!(allocated >= 3, "allocated {allocated}");

        let mut counted = 0;
        for b in 0..128 {
            if sm.get_count(b).unwrap() > 0 {
                counted += 1;
            }
        }
        assert_eq!(counted, allocated);
    }

    #[test]
    fn allocation_stays_self_consistent() {
        let (_, bm) = make_bm(128);
        let sm = create_metadata_sm(bm).unwrap();
        let before = sm.get_nr_allocated();

        let b = sm.new_block().unwrap().unwrap();
        assert_eq!(sm.get_count(b).unwrap(), 1);
        // Any metadata churn from the allocation is accounted too.
        let mut counted = 0;
        for blk in 0..128 {
            if sm.get_count(blk).unwrap() > 0 {
                counted += 1;
            }
        }
        assert_eq!(counted, sm.get_nr_allocated());
        assert!(sm.get_nr_allocated() > before);
    }

    #[test]
    fn commit_and_reopen() {
        let (io, bm) = make_bm(256);
        let mut root = [0_u8; 128];
        let expected: Vec<u32>;
        {
            let sm = create_metadata_sm(bm).unwrap();
            let a = sm.new_block().unwrap().unwrap();
            let b = sm.new_block().unwrap().unwrap();
            sm.inc(a).unwrap();
            sm.set_count(b, 9).unwrap();
            sm.commit().unwrap();
            assert!(sm.root_size() <= root.len());
            sm.copy_root(&mut root).unwrap();
            expected = (0..256).map(|blk| sm.get_count(blk).unwrap()).collect();
        }

        let bm2 = Arc::new(BlockManager::new(io));
        let sm = open_metadata_sm(bm2, &root).unwrap();
        for (blk, &want) in expected.iter().enumerate() {
            assert_eq!(sm.get_count(blk as u64).unwrap(), want, "block {blk}");
        }
        assert_eq!(
            sm.get_nr_allocated(),
            expected.iter().filter(|&&c| c > 0).count() as u64
        );
    }

    #[test]
    fn uncommitted_mutations_invisible_after_reopen() {
        let (io, bm) = make_bm(256);
        let mut root = [0_u8; 128];
        let committed: Vec<u32>;
        {
            let sm = create_metadata_sm(bm).unwrap();
            let a = sm.new_block().unwrap().unwrap();
            sm.set_count(a, 4).unwrap();
            sm.commit().unwrap();
            sm.copy_root(&mut root).unwrap();
            committed = (0..256).map(|blk| sm.get_count(blk).unwrap()).collect();

            // Mutate after the commit; these must not be visible through
            // the old root.
            for _ in 0..10 {
                sm.new_block().unwrap().unwrap();
            }
            sm.set_count(a, 1).unwrap();
        }

        let bm2 = Arc::new(BlockManager::new(io));
        let sm = open_metadata_sm(bm2, &root).unwrap();
        for (blk, &want) in committed.iter().enumerate() {
            assert_eq!(sm.get_count(blk as u64).unwrap(), want, "block {blk}");
        }
    }

    #[test]
    fn root_must_match_device_size() {
        let (io, bm) = make_bm(128);
        let mut root = [0_u8; 32];
        {
            let sm = create_metadata_sm(bm).unwrap();
            sm.commit().unwrap();
            sm.copy_root(&mut root).unwrap();
        }
        let io2 = Arc::new(MemoryIo::new(64).unwrap());
        let bm2 = Arc::new(BlockManager::new(io2));
        assert!(matches!(
            open_metadata_sm(bm2, &root),
            Err(MetaError::Corrupt { .. })
        ));
        let _ = io;
    }
}
