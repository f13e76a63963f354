#![forbid(unsafe_code)]
//! Persistent-data core of the thinmeta engine.
//!
//! This crate contains the reference-counting space maps that sit beneath a
//! thin-provisioning metadata engine, together with the structures they are
//! built from:
//!
//! - [`txn::TransactionManager`] — copy-on-write shadowing of metadata
//!   blocks; the only durability boundary is `commit`.
//! - [`btree`] — an on-disk copy-on-write B-tree with `u64` keys and
//!   fixed-width packed values, used for overflow reference counts and for
//!   the disk variant's bitmap index.
//! - [`space_map`] — the `SpaceMap` contract, the in-memory reference
//!   implementation, the careful-alloc and recursive decorators, and the
//!   persistent disk/metadata variants with their 32-byte root records.
//!
//! # The bootstrapping problem
//!
//! The metadata space map tracks the blocks consumed by the engine's own
//! structures — including the bitmap blocks and overflow-tree nodes the map
//! itself is made of. Incrementing a count can therefore re-enter the map:
//! an overflow-tree insert shadows a node, shadowing allocates, allocating
//! mutates counts. The [`space_map::RecursiveSpaceMap`] decorator converts
//! that re-entrancy into a deferred work queue drained after the outermost
//! mutation, and [`space_map::CarefulAllocSpaceMap`] keeps the allocator
//! from handing out blocks the current transaction's bookkeeping still
//! depends on.
//!
//! Everything here is synchronous and single-actor per map instance; see the
//! trait docs in [`space_map`] for the exact contract.

pub mod btree;
pub mod checksum;
pub mod space_map;
pub mod txn;

pub use space_map::{PersistentSpaceMap, SpaceMap};
pub use thinmeta_block::{BlockAddress, BLOCK_SIZE};
