//! Transaction manager: copy-on-write shadowing over a block manager.
//!
//! A transaction is the span between two `commit` calls. Within it, the
//! first write to any block goes to a freshly allocated location (a
//! *shadow*) and the original is left untouched; later writes to the same
//! logical block are in place, because the shadow is already private to this
//! transaction. Until a new root is adopted by the caller, every block
//! reachable from the previous root therefore still holds its committed
//! contents.
//!
//! The manager allocates shadows through the *current space map*, which is
//! swappable so that a metadata space map can be bootstrapped with a
//! transient in-memory map and then installed over it.
//!
//! # Invariants
//!
//! - A block address appears in the shadow set only if it was allocated
//!   during the current transaction.
//! - `shadow` never copies more than once per transaction per logical block.
//! - `commit` is the only point at which the backing store is synced.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use thinmeta_block::{BlockAddress, BlockBuf, BlockManager};
use thinmeta_error::{MetaError, Result};
use tracing::{debug, trace};

use crate::space_map::SpaceMap;

/// Copy-on-write transaction manager.
///
/// Single-actor: all methods take `&self` and use interior mutability so the
/// space map can call back into the manager while one of its own operations
/// is on the stack.
pub struct TransactionManager {
    bm: Arc<BlockManager>,
    sm: RefCell<Rc<dyn SpaceMap>>,
    shadows: RefCell<HashSet<BlockAddress>>,
}

impl TransactionManager {
    pub fn new(bm: Arc<BlockManager>, sm: Rc<dyn SpaceMap>) -> Rc<Self> {
        Rc::new(Self {
            bm,
            sm: RefCell::new(sm),
            shadows: RefCell::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.bm
    }

    /// The space map currently used for shadow allocation.
    #[must_use]
    pub fn space_map(&self) -> Rc<dyn SpaceMap> {
        self.sm.borrow().clone()
    }

    /// Install a different space map (metadata bootstrap hand-over).
    pub fn set_space_map(&self, sm: Rc<dyn SpaceMap>) {
        *self.sm.borrow_mut() = sm;
    }

    /// Read a block.
    pub fn read(&self, b: BlockAddress) -> Result<BlockBuf> {
        self.bm.read(b)
    }

    /// Write a block. The caller must own it within this transaction
    /// (freshly allocated or shadowed).
    pub fn write(&self, b: BlockAddress, buf: &BlockBuf) -> Result<()> {
        self.bm.write(b, buf)
    }

    /// Allocate a fresh block with reference count 1 and zero it.
    pub fn new_block(&self) -> Result<BlockAddress> {
        let sm = self.space_map();
        let b = sm.new_block()?.ok_or(MetaError::NoSpace)?;
        self.bm.write(b, &BlockBuf::zeroed())?;
        self.shadows.borrow_mut().insert(b);
        trace!(block = b, "allocated metadata block");
        Ok(b)
    }

    /// Shadow `orig` for writing.
    ///
    /// Returns the address to write through and whether the block moved. If
    /// `orig` was already shadowed this transaction the write is in place
    /// and nothing is copied. Otherwise the contents are copied to a new
    /// location and the old location is decremented.
    ///
    /// Note the copy is verbatim: blocks that embed their own address must
    /// be re-stamped by the caller after a move.
    pub fn shadow(&self, orig: BlockAddress) -> Result<(BlockAddress, bool)> {
        if self.shadows.borrow().contains(&orig) {
            return Ok((orig, false));
        }

        let sm = self.space_map();
        let fresh = sm.new_block()?.ok_or(MetaError::NoSpace)?;
        let buf = self.bm.read(orig)?;
        self.bm.write(fresh, &buf)?;
        self.shadows.borrow_mut().insert(fresh);
        sm.dec(orig)?;
        trace!(orig, fresh, "shadowed metadata block");
        Ok((fresh, true))
    }

    /// Number of blocks shadowed so far this transaction.
    #[must_use]
    pub fn nr_shadows(&self) -> usize {
        self.shadows.borrow().len()
    }

    /// Finalize the transaction: flush the space map, sync the backing
    /// store, and forget the shadow set so the next write to any block
    /// re-shadows it.
    ///
    /// The space map flush happens while the shadow set is still live, so
    /// any blocks it writes reuse this transaction's shadows.
    pub fn commit(&self) -> Result<()> {
        let sm = self.space_map();
        sm.commit()?;
        self.bm.sync()?;
        let nr = self.shadows.borrow().len();
        self.shadows.borrow_mut().clear();
        debug!(shadows = nr, "transaction committed");
        Ok(())
    }
}
