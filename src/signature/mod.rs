//! Block signatures used for delta sync
//!
//! A [`SignatureSet`] maps a block size to every block signature taken with
//! that size. Several sizes coexist because each sync re-derives the set from
//! the blocks it committed, and a file's block size can change between syncs.

pub mod file;
pub mod generate;
pub mod rolling;
pub mod strong;

pub use file::{decode, decode_bytes, encode, encode_to_bytes, read_signature, write_signature};
pub use generate::{build, build_from_bytes, build_from_reader, signature_from_blocks};
pub use rolling::RollingHash;
pub use strong::{block_id, content_hash, content_hash_file, StrongHash, STRONG_SIGNATURE_LEN};

use std::collections::HashMap;

/// Digest bytes of a block
pub type StrongSignature = [u8; STRONG_SIGNATURE_LEN];

/// Weak checksum of a byte window.
///
/// `s1` is the byte sum, `s2` the sum of `(len - i) * byte[i]`. Both fit in a
/// `u64` for any block a signature can describe (4 MB of 0xFF bytes gives an
/// `s2` around 2^51), so equality comparisons are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RollingSignature {
    pub s1: u64,
    pub s2: u64,
}

/// Signature of a single block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    /// Offset of the block. After matching this is the block's position in
    /// the file being synced, not where it was originally sampled.
    pub offset: i64,

    /// Block length in bytes
    pub size: u32,

    /// Weak checksum
    pub rolling: RollingSignature,

    /// Strong digest, also the block's content address
    pub strong: StrongSignature,

    /// Sequence number of the block within its signature
    pub block_number: u32,
}

impl BlockSignature {
    /// Offset one past the last byte of the block
    pub fn end(&self) -> i64 {
        self.offset + self.size as i64
    }
}

/// All block signatures of one block size
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteSignature {
    pub blocks: Vec<BlockSignature>,
}

/// Persisted signature of a file or blob: block size -> signatures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSet {
    pub signatures: HashMap<u32, CompleteSignature>,
}

impl SignatureSet {
    /// Create an empty signature set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block under the key of its own size
    pub fn insert(&mut self, block: BlockSignature) {
        self.signatures
            .entry(block.size)
            .or_default()
            .blocks
            .push(block);
    }

    /// Block sizes, largest first
    pub fn sizes_descending(&self) -> Vec<u32> {
        let mut sizes: Vec<u32> = self.signatures.keys().copied().collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes
    }

    /// Total number of blocks across all sizes
    pub fn block_count(&self) -> usize {
        self.signatures.values().map(|s| s.blocks.len()).sum()
    }

    /// Check whether the set holds no blocks
    pub fn is_empty(&self) -> bool {
        self.block_count() == 0
    }

    /// Sum of all block sizes
    pub fn total_size(&self) -> u64 {
        self.signatures
            .values()
            .flat_map(|s| s.blocks.iter())
            .map(|b| b.size as u64)
            .sum()
    }

    /// Every block across all sizes, sorted by ascending offset
    pub fn blocks_by_offset(&self) -> Vec<&BlockSignature> {
        let mut blocks: Vec<&BlockSignature> = self
            .signatures
            .values()
            .flat_map(|s| s.blocks.iter())
            .collect();
        blocks.sort_by_key(|b| b.offset);
        blocks
    }
}
