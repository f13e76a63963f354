//! On-disk copy-on-write B-tree.
//!
//! Maps `u64` keys to fixed-width packed values. Used by the space maps for
//! overflow reference counts (`u32` values) and for the disk variant's
//! bitmap index (`IndexEntry` values).
//!
//! Node layout within a 4 KiB block:
//!
//! ```text
//! +-------------+---------+----------------------------------+
//! | csum        | 4 bytes | crc32 of the rest, btree salt    |
//! | flags       | 4 bytes | 1 = internal, 2 = leaf           |
//! | blocknr     | 8 bytes | address this node lives at       |
//! | nr_entries  | 4 bytes |                                  |
//! | max_entries | 4 bytes | fixed per node kind              |
//! | value_size  | 4 bytes | 8 for internal, V::SIZE for leaf |
//! | padding     | 4 bytes | zero                             |
//! +-------------+---------+----------------------------------+
//! | keys        | 8 * max_entries bytes, sorted ascending    |
//! | values      | value_size * max_entries bytes             |
//! +-------------+--------------------------------------------+
//! ```
//!
//! Inserts split full nodes top-down while descending, so a parent is never
//! revisited after its child is written. Every node on a mutated path is
//! shadowed through the transaction manager first; since a shadow moves the
//! node, the node is rewritten with its new address before anything else
//! happens. Removal does not rebalance: underfull (even empty) leaves are
//! legal, and separator keys remain valid lower bounds for descent.

use std::cell::Cell;
use std::rc::Rc;
use thinmeta_block::{BlockAddress, BlockBuf, BLOCK_SIZE};
use thinmeta_error::{MetaError, Result};
use tracing::trace;

use crate::checksum::{self, BTREE_CSUM_XOR};
use crate::txn::TransactionManager;

/// Fixed-width value serialization for B-tree leaves.
pub trait Pack: Copy {
    /// Packed size in bytes.
    const SIZE: usize;

    fn pack(&self, out: &mut [u8]);
    fn unpack(data: &[u8]) -> Self;
}

impl Pack for u32 {
    const SIZE: usize = 4;

    fn pack(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn unpack(data: &[u8]) -> Self {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    }
}

impl Pack for u64 {
    const SIZE: usize = 8;

    fn pack(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn unpack(data: &[u8]) -> Self {
        u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])
    }
}

const NODE_HDR_SIZE: usize = 32;
const INTERNAL_NODE: u32 = 1;
const LEAF_NODE: u32 = 2;

const fn max_entries(value_size: usize) -> usize {
    (BLOCK_SIZE - NODE_HDR_SIZE) / (8 + value_size)
}

/// An unpacked node. Internal nodes carry child addresses as values.
#[derive(Debug, Clone)]
struct Node<V> {
    blocknr: BlockAddress,
    keys: Vec<u64>,
    values: Vec<V>,
}

impl<V: Pack> Node<V> {
    fn full(&self) -> bool {
        self.keys.len() >= max_entries(V::SIZE)
    }
}

#[derive(Debug)]
enum ParsedNode<V> {
    Internal(Node<u64>),
    Leaf(Node<V>),
}

impl<V: Pack> ParsedNode<V> {
    fn set_blocknr(&mut self, b: BlockAddress) {
        match self {
            Self::Internal(n) => n.blocknr = b,
            Self::Leaf(n) => n.blocknr = b,
        }
    }

    fn full(&self) -> bool {
        match self {
            Self::Internal(n) => n.full(),
            Self::Leaf(n) => n.full(),
        }
    }
}

fn corrupt(block: BlockAddress, detail: impl Into<String>) -> MetaError {
    MetaError::Corrupt {
        block,
        detail: detail.into(),
    }
}

fn parse_keys_values<V: Pack>(
    data: &[u8],
    blocknr: BlockAddress,
    nr_entries: usize,
    node_max: usize,
) -> Result<(Vec<u64>, Vec<V>)> {
    let mut keys = Vec::with_capacity(nr_entries);
    for i in 0..nr_entries {
        let off = NODE_HDR_SIZE + i * 8;
        let key = u64::unpack(&data[off..off + 8]);
        if let Some(&prev) = keys.last() {
            if key <= prev {
                return Err(corrupt(blocknr, "node keys not strictly ascending"));
            }
        }
        keys.push(key);
    }
    let values_base = NODE_HDR_SIZE + node_max * 8;
    let mut values = Vec::with_capacity(nr_entries);
    for i in 0..nr_entries {
        let off = values_base + i * V::SIZE;
        values.push(V::unpack(&data[off..off + V::SIZE]));
    }
    Ok((keys, values))
}

/// Parse and validate a node read from `expect` (its pre-shadow address).
fn parse_node<V: Pack>(buf: &BlockBuf, expect: BlockAddress) -> Result<ParsedNode<V>> {
    let data = buf.as_slice();
    if !checksum::verify(data, BTREE_CSUM_XOR) {
        return Err(corrupt(expect, "btree node checksum mismatch"));
    }
    let flags = u32::unpack(&data[4..8]);
    let blocknr = u64::unpack(&data[8..16]);
    let nr_entries = u32::unpack(&data[16..20]) as usize;
    let node_max = u32::unpack(&data[20..24]) as usize;
    let value_size = u32::unpack(&data[24..28]) as usize;

    if blocknr != expect {
        return Err(corrupt(
            expect,
            format!("btree node claims block {blocknr}"),
        ));
    }

    let (expected_vs, expected_max) = match flags {
        INTERNAL_NODE => (8, max_entries(8)),
        LEAF_NODE => (V::SIZE, max_entries(V::SIZE)),
        _ => return Err(corrupt(expect, format!("bad btree node flags {flags}"))),
    };
    if value_size != expected_vs {
        return Err(corrupt(
            expect,
            format!("btree value size {value_size}, expected {expected_vs}"),
        ));
    }
    if node_max != expected_max || nr_entries > node_max {
        return Err(corrupt(
            expect,
            format!("btree node geometry nr={nr_entries} max={node_max}"),
        ));
    }

    if flags == INTERNAL_NODE {
        let (keys, values) = parse_keys_values::<u64>(data, expect, nr_entries, node_max)?;
        if keys.is_empty() {
            return Err(corrupt(expect, "internal btree node has no entries"));
        }
        Ok(ParsedNode::Internal(Node {
            blocknr: expect,
            keys,
            values,
        }))
    } else {
        let (keys, values) = parse_keys_values::<V>(data, expect, nr_entries, node_max)?;
        Ok(ParsedNode::Leaf(Node {
            blocknr: expect,
            keys,
            values,
        }))
    }
}

fn pack_node<V: Pack>(node: &Node<V>, flags: u32) -> BlockBuf {
    let mut buf = BlockBuf::zeroed();
    let node_max = match flags {
        INTERNAL_NODE => max_entries(8),
        _ => max_entries(V::SIZE),
    };
    {
        let data = buf.as_mut_slice();
        flags.pack(&mut data[4..8]);
        node.blocknr.pack(&mut data[8..16]);
        (node.keys.len() as u32).pack(&mut data[16..20]);
        (node_max as u32).pack(&mut data[20..24]);
        (V::SIZE as u32).pack(&mut data[24..28]);
        for (i, key) in node.keys.iter().enumerate() {
            let off = NODE_HDR_SIZE + i * 8;
            key.pack(&mut data[off..off + 8]);
        }
        let values_base = NODE_HDR_SIZE + node_max * 8;
        for (i, value) in node.values.iter().enumerate() {
            let off = values_base + i * V::SIZE;
            value.pack(&mut data[off..off + V::SIZE]);
        }
        checksum::stamp(data, BTREE_CSUM_XOR);
    }
    buf
}

/// Index of the child to descend into: the last separator `<= key`, or the
/// first child when `key` sorts before every separator.
fn child_index(keys: &[u64], key: u64) -> usize {
    keys.partition_point(|&k| k <= key).saturating_sub(1)
}

/// Copy-on-write B-tree handle.
///
/// The root moves as the tree is mutated; read it back with [`Btree::root`]
/// after `commit` to persist a reopenable reference.
pub struct Btree<V: Pack> {
    tm: Rc<TransactionManager>,
    root: Cell<BlockAddress>,
    _marker: std::marker::PhantomData<V>,
}

impl<V: Pack> Btree<V> {
    /// Create an empty tree (a single empty leaf).
    pub fn create(tm: Rc<TransactionManager>) -> Result<Self> {
        let blocknr = tm.new_block()?;
        let leaf: Node<V> = Node {
            blocknr,
            keys: Vec::new(),
            values: Vec::new(),
        };
        tm.write(blocknr, &pack_node(&leaf, LEAF_NODE))?;
        trace!(root = blocknr, "created btree");
        Ok(Self {
            tm,
            root: Cell::new(blocknr),
            _marker: std::marker::PhantomData,
        })
    }

    /// Open an existing tree, validating the root node eagerly.
    pub fn open(tm: Rc<TransactionManager>, root: BlockAddress) -> Result<Self> {
        let buf = tm.read(root)?;
        parse_node::<V>(&buf, root)?;
        Ok(Self {
            tm,
            root: Cell::new(root),
            _marker: std::marker::PhantomData,
        })
    }

    /// Current root address.
    #[must_use]
    pub fn root(&self) -> BlockAddress {
        self.root.get()
    }

    fn write_leaf(&self, node: &Node<V>) -> Result<()> {
        self.tm.write(node.blocknr, &pack_node(node, LEAF_NODE))
    }

    fn write_internal(&self, node: &Node<u64>) -> Result<()> {
        self.tm.write(node.blocknr, &pack_node(node, INTERNAL_NODE))
    }

    fn write_parsed(&self, node: &ParsedNode<V>) -> Result<()> {
        match node {
            ParsedNode::Internal(n) => self.write_internal(n),
            ParsedNode::Leaf(n) => self.write_leaf(n),
        }
    }

    /// Shadow `b`, reparse at the new location, and restamp if it moved.
    fn shadow_node(&self, b: BlockAddress) -> Result<(ParsedNode<V>, bool)> {
        let (fresh, moved) = self.tm.shadow(b)?;
        let buf = self.tm.read(fresh)?;
        // A moved node still carries its old address until restamped.
        let mut node = parse_node::<V>(&buf, b)?;
        node.set_blocknr(fresh);
        if moved {
            self.write_parsed(&node)?;
        }
        Ok((node, moved))
    }

    /// Split a full node, returning `(low, high, pivot)`; both halves are
    /// written. The low half keeps the original address.
    fn split(&self, node: ParsedNode<V>) -> Result<(ParsedNode<V>, ParsedNode<V>, u64)> {
        match node {
            ParsedNode::Leaf(mut low) => {
                let mid = low.keys.len() / 2;
                let high = Node {
                    blocknr: self.tm.new_block()?,
                    keys: low.keys.split_off(mid),
                    values: low.values.split_off(mid),
                };
                let pivot = high.keys[0];
                self.write_leaf(&low)?;
                self.write_leaf(&high)?;
                Ok((ParsedNode::Leaf(low), ParsedNode::Leaf(high), pivot))
            }
            ParsedNode::Internal(mut low) => {
                let mid = low.keys.len() / 2;
                let high = Node {
                    blocknr: self.tm.new_block()?,
                    keys: low.keys.split_off(mid),
                    values: low.values.split_off(mid),
                };
                let pivot = high.keys[0];
                self.write_internal(&low)?;
                self.write_internal(&high)?;
                Ok((ParsedNode::Internal(low), ParsedNode::Internal(high), pivot))
            }
        }
    }

    fn addr(node: &ParsedNode<V>) -> BlockAddress {
        match node {
            ParsedNode::Internal(n) => n.blocknr,
            ParsedNode::Leaf(n) => n.blocknr,
        }
    }

    /// Insert `key -> value`, overwriting any existing entry.
    pub fn insert(&self, key: u64, value: V) -> Result<()> {
        let old_root = self.root.get();
        let (mut node, _) = self.shadow_node(old_root)?;
        self.root.set(Self::addr(&node));

        if node.full() {
            let (low, high, pivot) = self.split(node)?;
            let root = Node {
                blocknr: self.tm.new_block()?,
                keys: vec![
                    match &low {
                        ParsedNode::Internal(n) => n.keys[0],
                        ParsedNode::Leaf(n) => n.keys[0],
                    },
                    pivot,
                ],
                values: vec![Self::addr(&low), Self::addr(&high)],
            };
            self.write_internal(&root)?;
            self.root.set(root.blocknr);
            node = if key >= pivot { high } else { low };
        }

        loop {
            match node {
                ParsedNode::Leaf(mut leaf) => {
                    match leaf.keys.binary_search(&key) {
                        Ok(i) => leaf.values[i] = value,
                        Err(i) => {
                            leaf.keys.insert(i, key);
                            leaf.values.insert(i, value);
                        }
                    }
                    self.write_leaf(&leaf)?;
                    return Ok(());
                }
                ParsedNode::Internal(mut int) => {
                    let idx = child_index(&int.keys, key);
                    let child = int.values[idx];
                    let (cnode, moved) = self.shadow_node(child)?;
                    if moved {
                        int.values[idx] = Self::addr(&cnode);
                        self.write_internal(&int)?;
                    }
                    if cnode.full() {
                        let (low, high, pivot) = self.split(cnode)?;
                        int.keys.insert(idx + 1, pivot);
                        int.values.insert(idx + 1, Self::addr(&high));
                        self.write_internal(&int)?;
                        node = if key >= pivot { high } else { low };
                    } else {
                        node = cnode;
                    }
                }
            }
        }
    }

    /// Look up `key` without mutating anything.
    pub fn lookup(&self, key: u64) -> Result<Option<V>> {
        let mut b = self.root.get();
        loop {
            let buf = self.tm.read(b)?;
            match parse_node::<V>(&buf, b)? {
                ParsedNode::Leaf(leaf) => {
                    return Ok(leaf
                        .keys
                        .binary_search(&key)
                        .ok()
                        .map(|i| leaf.values[i]));
                }
                ParsedNode::Internal(int) => {
                    b = int.values[child_index(&int.keys, key)];
                }
            }
        }
    }

    /// Remove `key`, returning the removed value if it was present.
    ///
    /// Leaves are never rebalanced; an underfull leaf stays where it is.
    pub fn remove(&self, key: u64) -> Result<Option<V>> {
        let old_root = self.root.get();
        let (mut node, _) = self.shadow_node(old_root)?;
        self.root.set(Self::addr(&node));

        loop {
            match node {
                ParsedNode::Leaf(mut leaf) => match leaf.keys.binary_search(&key) {
                    Ok(i) => {
                        leaf.keys.remove(i);
                        let v = leaf.values.remove(i);
                        self.write_leaf(&leaf)?;
                        return Ok(Some(v));
                    }
                    Err(_) => return Ok(None),
                },
                ParsedNode::Internal(mut int) => {
                    let idx = child_index(&int.keys, key);
                    let child = int.values[idx];
                    let (cnode, moved) = self.shadow_node(child)?;
                    if moved {
                        int.values[idx] = Self::addr(&cnode);
                        self.write_internal(&int)?;
                    }
                    node = cnode;
                }
            }
        }
    }

    /// Visit every entry in ascending key order.
    pub fn walk<F>(&self, visit: &mut F) -> Result<()>
    where
        F: FnMut(u64, &V) -> Result<()>,
    {
        self.walk_node(self.root.get(), visit)
    }

    fn walk_node<F>(&self, b: BlockAddress, visit: &mut F) -> Result<()>
    where
        F: FnMut(u64, &V) -> Result<()>,
    {
        let buf = self.tm.read(b)?;
        match parse_node::<V>(&buf, b)? {
            ParsedNode::Leaf(leaf) => {
                for (key, value) in leaf.keys.iter().zip(leaf.values.iter()) {
                    visit(*key, value)?;
                }
                Ok(())
            }
            ParsedNode::Internal(int) => {
                for child in &int.values {
                    self.walk_node(*child, visit)?;
                }
                Ok(())
            }
        }
    }
}
