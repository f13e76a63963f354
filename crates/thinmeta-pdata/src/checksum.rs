//! Block checksums.
//!
//! Every metadata block starts with a 4-byte checksum: crc32 of the rest of
//! the block, XORed with a salt that identifies the block type. The salt
//! makes a bitmap block misread as a B-tree node (or vice versa) fail
//! validation even when the payload bytes happen to be plausible.

/// Salt for B-tree node blocks.
pub const BTREE_CSUM_XOR: u32 = 121_107;

/// Salt for space-map bitmap blocks.
pub const BITMAP_CSUM_XOR: u32 = 240_779;

/// Salt for space-map index blocks.
pub const INDEX_CSUM_XOR: u32 = 160_478;

/// Checksum of a block's payload (everything after the leading 4 bytes).
#[must_use]
pub fn block_csum(block: &[u8], salt: u32) -> u32 {
    crc32fast::hash(&block[4..]) ^ salt
}

/// Stamp the checksum into the block's first 4 bytes.
pub fn stamp(block: &mut [u8], salt: u32) {
    let sum = block_csum(block, salt);
    block[..4].copy_from_slice(&sum.to_le_bytes());
}

/// Check a block's stored checksum against its payload.
#[must_use]
pub fn verify(block: &[u8], salt: u32) -> bool {
    let stored = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    stored == block_csum(block, salt)
}
