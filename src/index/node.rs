//! B+tree node layout for hash-table entries
//!
//! Every node occupies exactly one block of the underlying [`BlockFile`]
//! and is identified by that block's address. Level 0 nodes are leaves;
//! levels >= 1 are index nodes routing a search key down to a leaf.
//!
//! ## Block layout
//! ```text
//! Leaf (level 0):
//!   [level: 1][num_entries: 4][prev: 8][next: 8]      = 21-byte header
//!   [key: f32][id: u32] * num_entries                 = 8 bytes per entry
//!
//! Index (level >= 1):
//!   [level: 1][num_children: 4]                       = 5-byte header
//!   [separator: f32] * (num_children - 1)
//!   [child: u64]     * num_children
//! ```
//! All integers and floats are little-endian. Index entries are smaller
//! than leaf entries, so the index fan-out exceeds the leaf capacity.

use crate::storage::{BlockId, NULL_BLOCK};
use crate::{IndexError, Result};

/// One hash-table entry: a hash projection value keyed to an object id.
///
/// The same shape carries (distance, id) pairs downstream in the query
/// algorithm; the index itself only ever uses `key` for ordering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    /// Hash projection value (ordering key)
    pub key: f32,

    /// Object identifier
    pub id: u32,
}

impl Entry {
    pub fn new(key: f32, id: u32) -> Self {
        Self { key, id }
    }
}

/// Bytes per packed leaf entry
pub const ENTRY_SIZE: usize = 8;

/// Leaf block header: level + num_entries + prev + next
pub const LEAF_HEADER_SIZE: usize = 1 + 4 + 8 + 8;

/// Index block header: level + num_children
pub const INDEX_HEADER_SIZE: usize = 1 + 4;

/// Bytes per separator key
const KEY_SIZE: usize = 4;

/// Bytes per child address
const CHILD_SIZE: usize = 8;

/// Maximum entries a leaf block can hold.
pub fn leaf_capacity(block_length: usize) -> usize {
    block_length.saturating_sub(LEAF_HEADER_SIZE) / ENTRY_SIZE
}

/// Maximum children an index block can hold.
///
/// A node with c children stores c - 1 separators, so the largest c with
/// `INDEX_HEADER_SIZE + (c - 1) * KEY_SIZE + c * CHILD_SIZE <= block_length`.
pub fn index_fanout(block_length: usize) -> usize {
    (block_length + KEY_SIZE).saturating_sub(INDEX_HEADER_SIZE) / (KEY_SIZE + CHILD_SIZE)
}

/// Terminal node: a run of entries plus sibling links into the leaf chain.
#[derive(Debug, Clone)]
pub struct LeafNode {
    /// Block address of this node
    pub block: BlockId,

    /// Previous leaf in key order, NULL_BLOCK at the front of the chain
    pub prev: BlockId,

    /// Next leaf in key order, NULL_BLOCK at the end of the chain
    pub next: BlockId,

    /// Entries in ascending key order
    pub entries: Vec<Entry>,
}

impl LeafNode {
    /// Slot of the first entry with key >= `key`, or `entries.len()` if none.
    pub fn search_ge(&self, key: f32) -> usize {
        self.entries.partition_point(|e| e.key < key)
    }

    /// Slot of the last entry with key <= `key`, or `None` if none.
    pub fn search_le(&self, key: f32) -> Option<usize> {
        self.entries.partition_point(|e| e.key <= key).checked_sub(1)
    }

    fn serialize(&self, block_length: usize) -> Result<Vec<u8>> {
        let capacity = leaf_capacity(block_length);
        if self.entries.len() > capacity {
            return Err(IndexError::Storage(format!(
                "leaf {} holds {} entries, capacity is {}",
                self.block,
                self.entries.len(),
                capacity
            )));
        }

        let mut buf = vec![0u8; block_length];
        buf[0] = 0;
        buf[1..5].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[5..13].copy_from_slice(&self.prev.to_le_bytes());
        buf[13..21].copy_from_slice(&self.next.to_le_bytes());

        let mut offset = LEAF_HEADER_SIZE;
        for entry in &self.entries {
            buf[offset..offset + 4].copy_from_slice(&entry.key.to_le_bytes());
            buf[offset + 4..offset + 8].copy_from_slice(&entry.id.to_le_bytes());
            offset += ENTRY_SIZE;
        }

        Ok(buf)
    }

    fn deserialize(block: BlockId, buf: &[u8]) -> Result<Self> {
        let num_entries =
            u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if num_entries == 0 || num_entries > leaf_capacity(buf.len()) {
            return Err(IndexError::Corruption(format!(
                "leaf {} has invalid entry count {}",
                block, num_entries
            )));
        }

        let prev = BlockId::from_le_bytes(buf[5..13].try_into().unwrap());
        let next = BlockId::from_le_bytes(buf[13..21].try_into().unwrap());

        let mut entries = Vec::with_capacity(num_entries);
        let mut offset = LEAF_HEADER_SIZE;
        for _ in 0..num_entries {
            let key = f32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
            let id = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
            entries.push(Entry { key, id });
            offset += ENTRY_SIZE;
        }

        Ok(Self {
            block,
            prev,
            next,
            entries,
        })
    }
}

/// Internal node: separator keys routing a search key to one of its children.
///
/// Child `i` covers keys in `[separators[i - 1], separators[i])`, open at
/// the extremes. A key equal to a separator routes to the right-hand child.
#[derive(Debug, Clone)]
pub struct IndexNode {
    /// Block address of this node
    pub block: BlockId,

    /// Height above the leaves, >= 1
    pub level: u8,

    /// Separator keys, one fewer than children
    pub separators: Vec<f32>,

    /// Child block addresses
    pub children: Vec<BlockId>,
}

impl IndexNode {
    /// Index of the child whose key range contains `key`.
    pub fn route(&self, key: f32) -> usize {
        self.separators.partition_point(|s| *s <= key)
    }

    fn serialize(&self, block_length: usize) -> Result<Vec<u8>> {
        let fanout = index_fanout(block_length);
        if self.children.len() > fanout {
            return Err(IndexError::Storage(format!(
                "index node {} holds {} children, fan-out is {}",
                self.block,
                self.children.len(),
                fanout
            )));
        }
        if self.children.len() != self.separators.len() + 1 {
            return Err(IndexError::Storage(format!(
                "index node {} has {} separators for {} children",
                self.block,
                self.separators.len(),
                self.children.len()
            )));
        }

        let mut buf = vec![0u8; block_length];
        buf[0] = self.level;
        buf[1..5].copy_from_slice(&(self.children.len() as u32).to_le_bytes());

        let mut offset = INDEX_HEADER_SIZE;
        for separator in &self.separators {
            buf[offset..offset + KEY_SIZE].copy_from_slice(&separator.to_le_bytes());
            offset += KEY_SIZE;
        }
        for child in &self.children {
            buf[offset..offset + CHILD_SIZE].copy_from_slice(&child.to_le_bytes());
            offset += CHILD_SIZE;
        }

        Ok(buf)
    }

    fn deserialize(block: BlockId, buf: &[u8]) -> Result<Self> {
        let level = buf[0];
        let num_children =
            u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if num_children < 1 || num_children > index_fanout(buf.len()) {
            return Err(IndexError::Corruption(format!(
                "index node {} has invalid child count {}",
                block, num_children
            )));
        }

        let mut separators = Vec::with_capacity(num_children - 1);
        let mut offset = INDEX_HEADER_SIZE;
        for _ in 0..num_children - 1 {
            separators.push(f32::from_le_bytes(
                buf[offset..offset + KEY_SIZE].try_into().unwrap(),
            ));
            offset += KEY_SIZE;
        }

        let mut children = Vec::with_capacity(num_children);
        for _ in 0..num_children {
            let child =
                BlockId::from_le_bytes(buf[offset..offset + CHILD_SIZE].try_into().unwrap());
            if child == NULL_BLOCK {
                return Err(IndexError::Corruption(format!(
                    "index node {} references the header block as a child",
                    block
                )));
            }
            children.push(child);
            offset += CHILD_SIZE;
        }

        Ok(Self {
            block,
            level,
            separators,
            children,
        })
    }
}

/// A node as read from or written to one block.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Index(IndexNode),
}

impl Node {
    /// Block address of this node.
    pub fn block(&self) -> BlockId {
        match self {
            Node::Leaf(leaf) => leaf.block,
            Node::Index(index) => index.block,
        }
    }

    pub fn serialize(&self, block_length: usize) -> Result<Vec<u8>> {
        match self {
            Node::Leaf(leaf) => leaf.serialize(block_length),
            Node::Index(index) => index.serialize(block_length),
        }
    }

    pub fn deserialize(block: BlockId, buf: &[u8]) -> Result<Self> {
        if buf.len() < LEAF_HEADER_SIZE {
            return Err(IndexError::Corruption(format!(
                "block {} too short to hold a node: {} bytes",
                block,
                buf.len()
            )));
        }

        if buf[0] == 0 {
            Ok(Node::Leaf(LeafNode::deserialize(block, buf)?))
        } else {
            Ok(Node::Index(IndexNode::deserialize(block, buf)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 64;

    fn sample_leaf() -> LeafNode {
        LeafNode {
            block: 3,
            prev: 2,
            next: 4,
            entries: vec![
                Entry::new(0.5, 10),
                Entry::new(0.5, 11),
                Entry::new(1.5, 12),
            ],
        }
    }

    #[test]
    fn test_capacities() {
        // 64-byte blocks: (64 - 21) / 8 = 5 entries, (64 - 1) / 12 = 5 children
        assert_eq!(leaf_capacity(BLOCK), 5);
        assert_eq!(index_fanout(BLOCK), 5);
        // The concrete layout from the construction scenario: capacity-2 leaves
        assert_eq!(leaf_capacity(37), 2);
        assert_eq!(index_fanout(37), 3);
    }

    #[test]
    fn test_leaf_round_trip() {
        let leaf = sample_leaf();
        let buf = Node::Leaf(leaf.clone()).serialize(BLOCK).unwrap();
        assert_eq!(buf.len(), BLOCK);

        match Node::deserialize(3, &buf).unwrap() {
            Node::Leaf(decoded) => {
                assert_eq!(decoded.block, 3);
                assert_eq!(decoded.prev, 2);
                assert_eq!(decoded.next, 4);
                assert_eq!(decoded.entries, leaf.entries);
            }
            Node::Index(_) => panic!("expected a leaf"),
        }
    }

    #[test]
    fn test_index_round_trip() {
        let node = IndexNode {
            block: 7,
            level: 1,
            separators: vec![0.9, 2.0],
            children: vec![1, 2, 3],
        };
        let buf = Node::Index(node.clone()).serialize(BLOCK).unwrap();

        match Node::deserialize(7, &buf).unwrap() {
            Node::Index(decoded) => {
                assert_eq!(decoded.level, 1);
                assert_eq!(decoded.separators, vec![0.9, 2.0]);
                assert_eq!(decoded.children, vec![1, 2, 3]);
            }
            Node::Leaf(_) => panic!("expected an index node"),
        }
    }

    #[test]
    fn test_leaf_over_capacity_rejected() {
        let mut leaf = sample_leaf();
        leaf.entries = (0..6).map(|i| Entry::new(i as f32, i)).collect();
        assert!(Node::Leaf(leaf).serialize(BLOCK).is_err());
    }

    #[test]
    fn test_deserialize_rejects_bad_entry_count() {
        let leaf = sample_leaf();
        let mut buf = Node::Leaf(leaf).serialize(BLOCK).unwrap();
        buf[1..5].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            Node::deserialize(3, &buf),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_null_child() {
        let node = IndexNode {
            block: 7,
            level: 1,
            separators: vec![1.0],
            children: vec![1, 2],
        };
        let mut buf = Node::Index(node).serialize(BLOCK).unwrap();
        // Zero out the first child address.
        let offset = INDEX_HEADER_SIZE + 4;
        buf[offset..offset + 8].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            Node::deserialize(7, &buf),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn test_leaf_search_ge() {
        let leaf = sample_leaf();
        assert_eq!(leaf.search_ge(0.0), 0);
        assert_eq!(leaf.search_ge(0.5), 0);
        assert_eq!(leaf.search_ge(0.6), 2);
        assert_eq!(leaf.search_ge(1.5), 2);
        assert_eq!(leaf.search_ge(9.0), 3);
    }

    #[test]
    fn test_leaf_search_le() {
        let leaf = sample_leaf();
        assert_eq!(leaf.search_le(0.0), None);
        assert_eq!(leaf.search_le(0.5), Some(1));
        assert_eq!(leaf.search_le(1.0), Some(1));
        assert_eq!(leaf.search_le(9.0), Some(2));
    }

    #[test]
    fn test_route_ties_go_right() {
        let node = IndexNode {
            block: 7,
            level: 1,
            separators: vec![0.9, 2.0],
            children: vec![1, 2, 3],
        };
        assert_eq!(node.route(0.1), 0);
        assert_eq!(node.route(0.9), 1);
        assert_eq!(node.route(1.0), 1);
        assert_eq!(node.route(2.0), 2);
        assert_eq!(node.route(5.0), 2);
    }
}
