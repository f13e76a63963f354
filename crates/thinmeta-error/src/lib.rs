#![forbid(unsafe_code)]
//! Error types for the thinmeta persistent-data engine.
//!
//! # Error Taxonomy
//!
//! `MetaError` is the single user-facing error type for every crate in the
//! workspace. It deliberately lives in a crate with no workspace
//! dependencies so the block layer and the persistent-data core can both
//! return it without cycles.
//!
//! | Variant | Raised by | Meaning |
//! |---------|-----------|---------|
//! | `Io` | block layer | operating-system I/O failure |
//! | `OutOfRange` | space maps | block address beyond the tracked range |
//! | `Underflow` | space maps | decrement of a zero reference count |
//! | `BufferTooSmall` | root serialization | caller buffer below `root_size()` |
//! | `Corrupt` | open / block reads | checksum, magic, or structural mismatch |
//! | `RecursionLimit` | recursive decorator | deferred-delta queue failed to drain |
//! | `NoSpace` | transaction manager | no free block for a structural write |
//! | `ReadOnly` | block layer | write attempted on a read-only backing |
//! | `Format` | constructors | invalid geometry or arguments |
//!
//! Running out of space in `SpaceMap::new_block` is *not* an error: it is
//! reported as `Ok(None)` and only becomes `NoSpace` when the transaction
//! manager needed that block for its own bookkeeping.

use thiserror::Error;

/// Unified error type for all thinmeta operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Block address outside the tracked address space.
    #[error("block {block} out of range (nr_blocks = {nr_blocks})")]
    OutOfRange { block: u64, nr_blocks: u64 },

    /// Reference count decrement below zero.
    #[error("reference count underflow at block {block}")]
    Underflow { block: u64 },

    /// Root serialization target smaller than `root_size()`.
    #[error("root buffer too small: need {needed} bytes, got {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// On-disk metadata failed to parse or is internally inconsistent.
    ///
    /// The `block` field names the metadata block that failed validation,
    /// enabling triage against the backing store.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    /// The deferred-delta queue did not drain within the pass bound.
    ///
    /// This indicates a defect in the space-map composition, not a
    /// recoverable runtime condition.
    #[error("space map recursion bound exceeded after {passes} passes")]
    RecursionLimit { passes: u32 },

    /// No free block available for a structural (shadow) write.
    #[error("no free blocks for metadata")]
    NoSpace,

    /// Write attempted against a read-only backing store.
    #[error("read-only block store")]
    ReadOnly,

    /// Invalid geometry or construction arguments.
    #[error("invalid format: {0}")]
    Format(String),
}

/// Result alias using `MetaError`.
pub type Result<T> = std::result::Result<T, MetaError>;
