//! Header-chain boundary consumed by the block puller.
//!
//! The puller never validates headers. It only asks two questions of the
//! chain: "is this header on the chain ending at that tip?" and "how high is
//! the consensus tip?". `HeaderIndex` answers both from memory, using skip
//! pointers so ancestor lookups stay logarithmic on long chains.

use alloy_primitives::{keccak256, B256};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Minimal header representation: identity, height and predecessor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Chain queries the puller depends on.
pub trait ChainState: Send + Sync {
    /// Returns true when `header` is `tip` or one of its ancestors.
    fn is_ancestor_or_self(&self, header: &BlockHeader, tip: &BlockHeader) -> bool;

    /// Height of the block the node currently considers its consensus tip.
    fn consensus_tip_height(&self) -> u64;

    /// True while the node is still bulk-syncing from far behind the network.
    fn is_initial_block_download(&self) -> bool;
}

/// Errors for header insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    UnknownParent(B256),
    NonContiguousNumber { expected: u64, got: u64 },
    GenesisAlreadySet(B256),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownParent(parent) => write!(f, "unknown parent {parent}"),
            Self::NonContiguousNumber { expected, got } => {
                write!(f, "non-contiguous header number: expected {expected}, got {got}")
            }
            Self::GenesisAlreadySet(hash) => write!(f, "genesis already set to {hash}"),
        }
    }
}

impl std::error::Error for ChainError {}

#[derive(Debug, Clone, Copy)]
struct IndexedHeader {
    header: BlockHeader,
    skip: Option<B256>,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: HashMap<B256, IndexedHeader>,
    genesis: Option<B256>,
    best: Option<BlockHeader>,
}

/// In-memory header tree (every known branch, not only the canonical one).
#[derive(Debug, Default)]
pub struct HeaderIndex {
    inner: RwLock<IndexInner>,
    consensus_tip: AtomicU64,
    initial_block_download: AtomicBool,
}

/// Clears the lowest set bit.
const fn invert_lowest_one(n: u64) -> u64 {
    n & n.wrapping_sub(1)
}

/// Height a header's skip pointer jumps to.
const fn skip_height(height: u64) -> u64 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

impl IndexInner {
    fn ancestor(&self, from: B256, height: u64) -> Option<IndexedHeader> {
        let mut walk = *self.entries.get(&from)?;
        if height > walk.header.number {
            return None;
        }
        while walk.header.number > height {
            let here = walk.header.number;
            let jump = skip_height(here);
            let prev_jump = skip_height(here - 1);
            let take_skip = walk.skip.is_some()
                && (jump == height
                    || (jump > height && !(prev_jump + 2 < jump && prev_jump >= height)));
            let next = match (take_skip, walk.skip) {
                (true, Some(skip)) => skip,
                _ => walk.header.parent_hash,
            };
            walk = *self.entries.get(&next)?;
        }
        Some(walk)
    }
}

impl HeaderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header whose parent is already known (or the genesis header).
    pub fn insert_header(&self, header: BlockHeader) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&header.hash) {
            return Ok(());
        }

        let skip = if header.number == 0 {
            if let Some(genesis) = inner.genesis {
                return Err(ChainError::GenesisAlreadySet(genesis));
            }
            inner.genesis = Some(header.hash);
            None
        } else {
            let parent = inner
                .entries
                .get(&header.parent_hash)
                .ok_or(ChainError::UnknownParent(header.parent_hash))?;
            let expected = parent.header.number + 1;
            if header.number != expected {
                return Err(ChainError::NonContiguousNumber {
                    expected,
                    got: header.number,
                });
            }
            inner
                .ancestor(header.parent_hash, skip_height(header.number))
                .map(|entry| entry.header.hash)
        };

        inner.entries.insert(header.hash, IndexedHeader { header, skip });
        if inner.best.map_or(true, |best| header.number > best.number) {
            inner.best = Some(header);
        }
        Ok(())
    }

    /// Header at `height` on the branch ending at `tip`.
    pub fn ancestor_at(&self, tip: B256, height: u64) -> Option<BlockHeader> {
        self.inner.read().ancestor(tip, height).map(|entry| entry.header)
    }

    /// Highest header known on any branch.
    pub fn best_header(&self) -> Option<BlockHeader> {
        self.inner.read().best
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn set_consensus_tip_height(&self, height: u64) {
        self.consensus_tip.store(height, Ordering::SeqCst);
    }

    pub fn set_initial_block_download(&self, active: bool) {
        self.initial_block_download.store(active, Ordering::SeqCst);
    }
}

impl ChainState for HeaderIndex {
    fn is_ancestor_or_self(&self, header: &BlockHeader, tip: &BlockHeader) -> bool {
        if header.number > tip.number {
            return false;
        }
        if header.hash == tip.hash {
            return true;
        }
        self.ancestor_at(tip.hash, header.number)
            .is_some_and(|ancestor| ancestor.hash == header.hash)
    }

    fn consensus_tip_height(&self) -> u64 {
        self.consensus_tip.load(Ordering::SeqCst)
    }

    fn is_initial_block_download(&self) -> bool {
        self.initial_block_download.load(Ordering::SeqCst)
    }
}

/// Deterministic header hash used by the simulator and tests.
pub fn derive_header_hash(parent_hash: B256, number: u64, salt: u64) -> B256 {
    let mut preimage = [0u8; 48];
    preimage[..32].copy_from_slice(parent_hash.as_slice());
    preimage[32..40].copy_from_slice(&number.to_be_bytes());
    preimage[40..].copy_from_slice(&salt.to_be_bytes());
    keccak256(preimage)
}

/// Appends `count` headers on top of `parent` (or starting at genesis) and
/// returns them in ascending order. Different salts produce divergent
/// branches from the same parent.
pub fn extend_chain(
    index: &HeaderIndex,
    parent: Option<BlockHeader>,
    count: u64,
    salt: u64,
) -> Result<Vec<BlockHeader>, ChainError> {
    let mut headers = Vec::with_capacity(count as usize);
    let (mut number, mut parent_hash) = match parent {
        Some(parent) => (parent.number + 1, parent.hash),
        None => (0, B256::ZERO),
    };
    for _ in 0..count {
        let header = BlockHeader {
            number,
            hash: derive_header_hash(parent_hash, number, salt),
            parent_hash,
        };
        index.insert_header(header)?;
        headers.push(header);
        parent_hash = header.hash;
        number += 1;
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_from_u64(value: u64) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        B256::from(bytes)
    }

    #[test]
    fn skip_heights_point_backwards() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        for height in 2..2048u64 {
            assert!(skip_height(height) < height, "height {height}");
        }
    }

    #[test]
    fn ancestor_lookup_matches_linear_walk() {
        let index = HeaderIndex::new();
        let headers = extend_chain(&index, None, 1500, 0).unwrap();
        let tip = *headers.last().unwrap();
        for height in [0u64, 1, 2, 7, 255, 256, 1000, 1498, 1499] {
            assert_eq!(
                index.ancestor_at(tip.hash, height),
                Some(headers[height as usize]),
                "height {height}"
            );
        }
        assert_eq!(index.ancestor_at(tip.hash, 1500), None);
    }

    #[test]
    fn ancestry_respects_forks() {
        let index = HeaderIndex::new();
        let main = extend_chain(&index, None, 1000, 0).unwrap();
        let fork = extend_chain(&index, Some(main[499]), 500, 7).unwrap();
        let main_tip = main[999];
        let fork_tip = fork[499];
        assert_eq!(fork_tip.number, 999);

        assert!(index.is_ancestor_or_self(&main[250], &fork_tip));
        assert!(index.is_ancestor_or_self(&main[499], &fork_tip));
        assert!(!index.is_ancestor_or_self(&main[500], &fork_tip));
        assert!(!index.is_ancestor_or_self(&fork[0], &main_tip));
        assert!(index.is_ancestor_or_self(&main_tip, &main_tip));
        assert!(!index.is_ancestor_or_self(&main_tip, &main[998]));
    }

    #[test]
    fn insert_rejects_unknown_parent() {
        let index = HeaderIndex::new();
        let genesis = BlockHeader {
            number: 0,
            hash: hash_from_u64(1),
            parent_hash: B256::ZERO,
        };
        index.insert_header(genesis).unwrap();
        let orphan = BlockHeader {
            number: 2,
            hash: hash_from_u64(10),
            parent_hash: hash_from_u64(9),
        };
        assert_eq!(
            index.insert_header(orphan),
            Err(ChainError::UnknownParent(hash_from_u64(9)))
        );
    }

    #[test]
    fn insert_rejects_gap_and_second_genesis() {
        let index = HeaderIndex::new();
        let genesis = BlockHeader {
            number: 0,
            hash: hash_from_u64(1),
            parent_hash: B256::ZERO,
        };
        index.insert_header(genesis).unwrap();
        let skipped = BlockHeader {
            number: 5,
            hash: hash_from_u64(2),
            parent_hash: hash_from_u64(1),
        };
        assert_eq!(
            index.insert_header(skipped),
            Err(ChainError::NonContiguousNumber { expected: 1, got: 5 })
        );
        let other_genesis = BlockHeader {
            number: 0,
            hash: hash_from_u64(3),
            parent_hash: B256::ZERO,
        };
        assert_eq!(
            index.insert_header(other_genesis),
            Err(ChainError::GenesisAlreadySet(hash_from_u64(1)))
        );
    }

    #[test]
    fn best_header_tracks_highest_branch() {
        let index = HeaderIndex::new();
        let main = extend_chain(&index, None, 10, 0).unwrap();
        let fork = extend_chain(&index, Some(main[4]), 8, 1).unwrap();
        assert_eq!(index.best_header(), Some(fork[7]));
        assert_eq!(index.len(), 18);
        index.set_consensus_tip_height(9);
        assert_eq!(index.consensus_tip_height(), 9);
        assert!(!index.is_initial_block_download());
    }
}
