#![forbid(unsafe_code)]

//! Ordered map from block anchors to blocks.
//!
//! The leftmost block is anchored at the empty key so that a floor lookup for
//! any non-empty key always lands on a block. Every other block is anchored at
//! the key of its first record. Lookups take no locks; whatever they return
//! must be re-checked once the block lock is held.

use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::storage::block::SharedBlock;

/// A block together with the anchor it was found under.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    /// Key the block is published under.
    pub anchor: Vec<u8>,
    /// The block itself.
    pub block: Arc<SharedBlock>,
}

impl IndexEntry {
    fn from_entry(entry: crossbeam_skiplist::map::Entry<'_, Vec<u8>, Arc<SharedBlock>>) -> Self {
        Self {
            anchor: entry.key().clone(),
            block: Arc::clone(entry.value()),
        }
    }

    /// Whether this entry still names the same block as `other`.
    pub fn same_block(&self, other: &IndexEntry) -> bool {
        self.anchor == other.anchor && Arc::ptr_eq(&self.block, &other.block)
    }
}

/// Lock-free ordered index over all blocks of an engine.
pub struct BlockIndex {
    map: SkipMap<Vec<u8>, Arc<SharedBlock>>,
}

impl BlockIndex {
    /// Creates an index whose only block is `root`, anchored at the empty key.
    pub fn new(root: Arc<SharedBlock>) -> Self {
        let map = SkipMap::new();
        map.insert(Vec::new(), root);
        Self { map }
    }

    /// Block responsible for `key`: the greatest anchor `<= key`.
    pub fn floor(&self, key: &[u8]) -> Option<IndexEntry> {
        self.map
            .upper_bound(Bound::Included(key))
            .map(IndexEntry::from_entry)
    }

    /// Greatest anchor strictly below `key`.
    pub fn lower(&self, key: &[u8]) -> Option<IndexEntry> {
        self.map
            .upper_bound(Bound::Excluded(key))
            .map(IndexEntry::from_entry)
    }

    /// Smallest anchor strictly above `key`.
    pub fn higher(&self, key: &[u8]) -> Option<IndexEntry> {
        self.map
            .lower_bound(Bound::Excluded(key))
            .map(IndexEntry::from_entry)
    }

    /// Leftmost block.
    pub fn first(&self) -> Option<IndexEntry> {
        self.map.front().map(IndexEntry::from_entry)
    }

    /// Rightmost block.
    pub fn last(&self) -> Option<IndexEntry> {
        self.map.back().map(IndexEntry::from_entry)
    }

    /// Publishes `block` under `anchor`, replacing whatever was there.
    pub fn publish(&self, anchor: Vec<u8>, block: Arc<SharedBlock>) {
        self.map.insert(anchor, block);
    }

    /// Removes `anchor` if it still names `block`.
    pub fn retire(&self, anchor: &[u8], block: &Arc<SharedBlock>) -> bool {
        match self.map.get(anchor) {
            Some(entry) if Arc::ptr_eq(entry.value(), block) => entry.remove(),
            _ => false,
        }
    }

    /// Number of published blocks.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no block is published; never true for an open engine.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates the current entries in anchor order.
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.map.iter().map(IndexEntry::from_entry)
    }
}

impl std::fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIndex")
            .field("blocks", &self.map.len())
            .finish()
    }
}
