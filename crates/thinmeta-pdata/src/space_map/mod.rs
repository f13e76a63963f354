//! Reference-counting space maps.
//!
//! A space map tracks a `u32` reference count per block of a device. The
//! in-memory [`core::CoreSpaceMap`] is the reference implementation; the
//! persistent variants in [`disk`] and [`metadata`] store counts in bitmap
//! blocks (2 bits per block, with an overflow B-tree for counts above 2) and
//! survive reopen through a 32-byte root record.
//!
//! Two decorators adjust allocation behaviour:
//!
//! - [`careful_alloc::CarefulAllocSpaceMap`] refuses to hand out blocks that
//!   were freed or allocated within the current transaction, so a crash
//!   before commit can never have overwritten data the committed tree still
//!   references.
//! - [`recursive::RecursiveSpaceMap`] makes a self-describing map safe: when
//!   a count adjustment re-enters the map (because persisting the adjustment
//!   allocates or frees metadata blocks), the nested adjustments are queued
//!   and drained after the outermost one completes.
//!
//! All maps are single-actor: methods take `&self` with interior mutability,
//! and no instance is shared across threads.

pub mod careful_alloc;
pub mod common;
pub mod core;
pub mod disk;
pub mod metadata;
pub mod recursive;

pub use self::careful_alloc::CarefulAllocSpaceMap;
pub use self::common::{SmRoot, MAX_ROOT_SIZE};
pub use self::core::CoreSpaceMap;
pub use self::disk::{create_disk_sm, open_disk_sm, DiskSpaceMap};
pub use self::metadata::{create_metadata_sm, open_metadata_sm, MetadataSpaceMap};
pub use self::recursive::RecursiveSpaceMap;

use thinmeta_block::BlockAddress;
use thinmeta_error::Result;

/// Per-block reference counts over a fixed-size device.
///
/// Counts saturate nowhere: `inc` past `u32::MAX` is the caller's bug, `dec`
/// below zero is reported as `MetaError::Underflow`. A block is *free* when
/// its count is zero; `get_nr_free` and `get_nr_allocated` partition the
/// device accordingly.
pub trait SpaceMap {
    /// Total number of blocks managed.
    fn get_nr_blocks(&self) -> u64;

    /// Number of blocks with a zero count.
    fn get_nr_free(&self) -> u64;

    /// Reference count of `b`.
    fn get_count(&self, b: BlockAddress) -> Result<u32>;

    /// Set the count of `b` to an arbitrary value.
    fn set_count(&self, b: BlockAddress, count: u32) -> Result<()>;

    /// Increment the count of `b`.
    fn inc(&self, b: BlockAddress) -> Result<()>;

    /// Decrement the count of `b`. Errors with `Underflow` if it is zero.
    fn dec(&self, b: BlockAddress) -> Result<()>;

    /// Allocate: find a free block, set its count to 1, and return it.
    /// Returns `Ok(None)` when no block is free.
    fn new_block(&self) -> Result<Option<BlockAddress>>;

    /// Find a free block at or after `begin` without claiming it.
    ///
    /// Read-only: repeated calls with the same argument return the same
    /// answer until a count changes. Decorators rely on this to probe for
    /// space without re-entering the map.
    fn find_free(&self, begin: BlockAddress) -> Result<Option<BlockAddress>>;

    /// Flush any internal state so the map is consistent for the caller's
    /// commit. In-memory maps do nothing here.
    fn commit(&self) -> Result<()>;

    /// Number of blocks with a non-zero count.
    fn get_nr_allocated(&self) -> u64 {
        self.get_nr_blocks() - self.get_nr_free()
    }
}

/// A space map whose state persists on disk and can be reopened from a small
/// root record.
///
/// `copy_root` must only be called after `commit`; between mutations the
/// root cells may be stale.
pub trait PersistentSpaceMap: SpaceMap {
    /// Size in bytes of the root record written by `copy_root`.
    fn root_size(&self) -> usize;

    /// Serialize the root record into `out`, returning the bytes written.
    /// Errors with `BufferTooSmall` if `out` cannot hold it.
    fn copy_root(&self, out: &mut [u8]) -> Result<usize>;
}
