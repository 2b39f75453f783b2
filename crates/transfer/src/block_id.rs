//! Deterministic block identifiers.
//!
//! A restarted transfer must regenerate the identifiers of blocks it already
//! uploaded, otherwise those uncommitted blocks leak on the service. Ids are
//! therefore derived from the destination name and the chunk index only.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

/// Block indices are rendered with this many digits.
const INDEX_DIGITS: usize = 6;

/// Most blocks one destination can be split into while every id keeps the
/// same length.
pub const MAX_ID_BLOCKS: u64 = 10u64.pow(INDEX_DIGITS as u32);

/// Derives block ids for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIdGenerator {
    prefix: String,
}

impl BlockIdGenerator {
    /// `name` is the destination object name.
    pub fn new(name: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(name.as_bytes());
        Self {
            prefix: hex::encode(hasher.finalize()),
        }
    }

    /// Id of the block at `index`. All ids of one destination have equal length.
    pub fn id(&self, index: u64) -> String {
        STANDARD.encode(format!("{}{index:0INDEX_DIGITS$}", self.prefix))
    }

    /// Id of the block starting at `offset`.
    pub fn id_for_offset(&self, offset: u64, block_size: u64) -> String {
        self.id(offset / block_size)
    }

    /// Ordered ids for an object made of `count` blocks.
    pub fn ids(&self, count: u64) -> Vec<String> {
        (0..count).map(|i| self.id(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_generators_agree() {
        let a = BlockIdGenerator::new("container/videos/big.mp4");
        let b = BlockIdGenerator::new("container/videos/big.mp4");
        for i in [0, 1, 37, 49_999] {
            assert_eq!(a.id(i), b.id(i));
        }
    }

    #[test]
    fn last_addressable_block_keeps_the_id_length() {
        let g = BlockIdGenerator::new("c/huge.bin");
        assert_eq!(g.id(0).len(), g.id(MAX_ID_BLOCKS - 1).len());
    }

    #[test]
    fn names_and_indices_distinguish() {
        let a = BlockIdGenerator::new("c/a");
        let b = BlockIdGenerator::new("c/b");
        assert_ne!(a.id(0), b.id(0));
        assert_ne!(a.id(0), a.id(1));
    }

    #[test]
    fn ids_have_equal_length() {
        let g = BlockIdGenerator::new("c/x");
        assert_eq!(g.id(0).len(), g.id(49_999).len());
        assert_eq!(g.id_for_offset(8, 4), g.id(2));
        assert_eq!(g.ids(3), vec![g.id(0), g.id(1), g.id(2)]);
    }
}
