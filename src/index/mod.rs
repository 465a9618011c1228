//! Index layer implementation
//!
//! The disk-resident B+tree over one hash table, and its node layout.

pub mod btree;
pub mod node;

pub use btree::{BTree, Position, RangeScan, ScanDirection};
pub use node::{index_fanout, leaf_capacity, Entry, IndexNode, LeafNode, Node};
