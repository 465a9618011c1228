//! Disk-resident B+tree over one QALSH hash table
//!
//! ## Design
//! - **Bulk-constructed, then read-only**: the hash-table pipeline sorts all
//!   (projection, id) pairs for one hash function and hands them over once;
//!   the tree is built bottom-up in a single pass and never mutated again
//! - **Leaf chain**: leaves are doubly linked in key order, so a scan seeded
//!   anywhere can walk the whole table forward or backward one entry at a
//!   time, one extra block read per leaf boundary
//! - **Lazy root**: restoring a tree only reads the header; the root node is
//!   materialized into memory on first use and cached for the life of the
//!   handle, all other nodes are read per traversal
//!
//! ## Query usage
//! The collision-counting query algorithm calls [`BTree::locate`] once per
//! hash table to seed both an ascending and a descending [`BTree::scan`],
//! then interleaves the two iterators until its own stopping rule fires.

use crate::index::node::{index_fanout, leaf_capacity, Entry, IndexNode, LeafNode, Node};
use crate::storage::{BlockFile, BlockId, NULL_BLOCK};
use crate::{IndexError, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Direction of a range scan over the leaf chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Walk toward larger keys via `next` links
    Ascending,
    /// Walk toward smaller keys via `prev` links
    Descending,
}

/// A slot inside a leaf, as returned by [`BTree::locate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Leaf block address
    pub block: BlockId,

    /// Entry slot within that leaf
    pub slot: usize,
}

/// Disk-resident B+tree indexing one sorted hash table.
pub struct BTree {
    /// Block storage holding every node plus the header
    file: BlockFile,

    /// Lazily materialized root node, shared read-only once built
    root_cache: RwLock<Option<Arc<Node>>>,
}

impl BTree {
    /// Initialize a new, empty index over a fresh block file.
    ///
    /// Fails with `Config` if `block_length` cannot hold at least one leaf
    /// entry or an index node with two children.
    pub fn create<P: AsRef<Path>>(block_length: usize, path: P) -> Result<Self> {
        if leaf_capacity(block_length) < 1 || index_fanout(block_length) < 2 {
            return Err(IndexError::Config(format!(
                "block length {} too small for a node",
                block_length
            )));
        }

        let file = BlockFile::create(path, block_length)?;
        Ok(Self {
            file,
            root_cache: RwLock::new(None),
        })
    }

    /// Load an existing index. Reads and validates the header only; the
    /// root node itself is materialized lazily on first access.
    pub fn restore<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BlockFile::open(path)?;

        let root = file.root();
        if root != NULL_BLOCK && root >= file.num_blocks() {
            return Err(IndexError::CorruptHeader(format!(
                "root address {} out of range ({} blocks)",
                root,
                file.num_blocks()
            )));
        }

        Ok(Self {
            file,
            root_cache: RwLock::new(None),
        })
    }

    /// Fixed block size of the underlying file.
    pub fn block_length(&self) -> usize {
        self.file.block_length()
    }

    /// Root block address, NULL_BLOCK until construction completes.
    pub fn root(&self) -> BlockId {
        self.file.root()
    }

    /// Build the whole index from entries sorted ascending by key.
    ///
    /// Leaves are cut at the leaf capacity (the last may hold fewer) and
    /// linked into a chain; index levels are then built bottom-up at the
    /// index fan-out until a single root remains. The header is written
    /// last, so a failure mid-build leaves the previous header intact.
    ///
    /// Sortedness is a caller contract and is not checked; an unsorted
    /// table produces a structurally valid but semantically wrong tree.
    ///
    /// Returns the number of blocks allocated.
    pub fn bulk_construct(&self, table: &[Entry]) -> Result<u64> {
        if table.is_empty() {
            return Err(IndexError::EmptyTable);
        }
        if self.file.root() != NULL_BLOCK {
            return Err(IndexError::Storage(
                "index already constructed; bulk construction runs once".into(),
            ));
        }

        let block_length = self.file.block_length();
        let capacity = leaf_capacity(block_length);
        let fanout = index_fanout(block_length);
        let blocks_before = self.file.num_blocks();

        // Leaf level: addresses first, so sibling links can point forward.
        let num_leaves = table.len().div_ceil(capacity);
        let mut leaf_blocks = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            leaf_blocks.push(self.file.alloc()?);
        }

        let mut level: Vec<(f32, BlockId)> = Vec::with_capacity(num_leaves);
        for (i, chunk) in table.chunks(capacity).enumerate() {
            let leaf = LeafNode {
                block: leaf_blocks[i],
                prev: if i == 0 { NULL_BLOCK } else { leaf_blocks[i - 1] },
                next: if i + 1 == num_leaves {
                    NULL_BLOCK
                } else {
                    leaf_blocks[i + 1]
                },
                entries: chunk.to_vec(),
            };
            let buf = Node::Leaf(leaf).serialize(block_length)?;
            self.file.write(leaf_blocks[i], &buf)?;
            level.push((chunk[0].key, leaf_blocks[i]));
        }

        // Index levels: each child is paired with its subtree's first key;
        // the first key of a group is implicit, the rest become separators.
        let mut node_level = 1u8;
        while level.len() > 1 {
            let sizes = group_sizes(level.len(), fanout);
            let mut parents = Vec::with_capacity(sizes.len());
            let mut start = 0;
            for size in sizes {
                let group = &level[start..start + size];
                start += size;
                let block = self.file.alloc()?;
                let node = IndexNode {
                    block,
                    level: node_level,
                    separators: group[1..].iter().map(|(key, _)| *key).collect(),
                    children: group.iter().map(|(_, child)| *child).collect(),
                };
                let buf = Node::Index(node).serialize(block_length)?;
                self.file.write(block, &buf)?;
                parents.push((group[0].0, block));
            }
            level = parents;
            node_level += 1;
        }

        // Nodes reach stable storage before the header points at them.
        self.file.sync()?;
        self.file.set_root(level[0].1)?;
        self.file.sync()?;
        self.release_root();

        Ok(self.file.num_blocks() - blocks_before)
    }

    /// Descend from the root to the leaf covering `key` and return the
    /// position of the first entry with key >= `key` (ascending) or the
    /// last entry with key <= `key` (descending).
    ///
    /// Returns `None` past the corresponding end of the table, and on a
    /// tree that was never constructed. Costs O(height) block reads.
    pub fn locate(&self, key: f32, direction: ScanDirection) -> Result<Option<Position>> {
        let Some(root) = self.load_root()? else {
            return Ok(None);
        };

        let leaf = self.descend(&root, key)?;
        match direction {
            ScanDirection::Ascending => {
                let slot = leaf.search_ge(key);
                if slot < leaf.entries.len() {
                    return Ok(Some(Position {
                        block: leaf.block,
                        slot,
                    }));
                }
                // Past the end of this leaf: the answer is the head of the
                // next one. One sibling hop suffices since leaves are
                // never empty, but follow the chain defensively.
                let mut next = leaf.next;
                while next != NULL_BLOCK {
                    let sibling = self.read_leaf(next)?;
                    if !sibling.entries.is_empty() {
                        return Ok(Some(Position {
                            block: sibling.block,
                            slot: 0,
                        }));
                    }
                    next = sibling.next;
                }
                Ok(None)
            }
            ScanDirection::Descending => {
                if let Some(slot) = leaf.search_le(key) {
                    return Ok(Some(Position {
                        block: leaf.block,
                        slot,
                    }));
                }
                let mut prev = leaf.prev;
                while prev != NULL_BLOCK {
                    let sibling = self.read_leaf(prev)?;
                    if !sibling.entries.is_empty() {
                        return Ok(Some(Position {
                            block: sibling.block,
                            slot: sibling.entries.len() - 1,
                        }));
                    }
                    prev = sibling.prev;
                }
                Ok(None)
            }
        }
    }

    /// Lazily walk the leaf chain starting at `position`, in `direction`.
    ///
    /// The iterator is finite, safe to drop at any point, and restartable
    /// through a fresh [`BTree::locate`]. Crossing a sibling link costs one
    /// block read.
    pub fn scan(&self, position: Position, direction: ScanDirection) -> RangeScan<'_> {
        RangeScan {
            tree: self,
            direction,
            leaf: None,
            slot: 0,
            pending: Some((position.block, Whence::Slot(position.slot))),
            done: false,
        }
    }

    /// Materialize the root node if absent and return the cached copy.
    ///
    /// Double-checked under the cache lock: concurrent first readers
    /// perform at most one redundant block read, never a torn cache.
    fn load_root(&self) -> Result<Option<Arc<Node>>> {
        let root = self.file.root();
        if root == NULL_BLOCK {
            return Ok(None);
        }

        if let Some(node) = self.root_cache.read().as_ref() {
            return Ok(Some(Arc::clone(node)));
        }

        let mut cache = self.root_cache.write();
        if let Some(node) = cache.as_ref() {
            return Ok(Some(Arc::clone(node)));
        }

        let node = Arc::new(self.read_node(root)?);
        *cache = Some(Arc::clone(&node));
        Ok(Some(node))
    }

    /// Discard the cached root node.
    fn release_root(&self) {
        *self.root_cache.write() = None;
    }

    fn read_node(&self, block: BlockId) -> Result<Node> {
        let buf = self.file.read(block)?;
        Node::deserialize(block, &buf)
    }

    fn read_leaf(&self, block: BlockId) -> Result<LeafNode> {
        match self.read_node(block)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Index(_) => Err(IndexError::Corruption(format!(
                "block {} holds an index node where a leaf was expected",
                block
            ))),
        }
    }

    fn descend(&self, root: &Node, key: f32) -> Result<LeafNode> {
        let mut child = match root {
            Node::Leaf(leaf) => return Ok(leaf.clone()),
            Node::Index(index) => index.children[index.route(key)],
        };

        loop {
            match self.read_node(child)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Index(index) => child = index.children[index.route(key)],
            }
        }
    }
}

/// Cut one index level's children into per-node groups.
///
/// Groups are filled to the fan-out, except that a tail remainder smaller
/// than the minimum occupancy is balanced across the last two nodes so no
/// non-root node ends up underfull.
fn group_sizes(len: usize, fanout: usize) -> Vec<usize> {
    let min = fanout.div_ceil(2);
    let mut sizes = Vec::with_capacity(len.div_ceil(fanout));
    let mut remaining = len;
    while remaining > 0 {
        if remaining <= fanout {
            sizes.push(remaining);
            remaining = 0;
        } else if remaining < fanout + min {
            let first = remaining.div_ceil(2);
            sizes.push(first);
            sizes.push(remaining - first);
            remaining = 0;
        } else {
            sizes.push(fanout);
            remaining -= fanout;
        }
    }
    sizes
}

/// Where to resume within a leaf that has not been loaded yet.
#[derive(Debug, Clone, Copy)]
enum Whence {
    /// A concrete slot (initial position, or slot 0 after a forward hop)
    Slot(usize),
    /// The last slot, resolved once the leaf is in memory
    Last,
}

/// Lazy ordered traversal over the leaf chain.
///
/// Yields `Result<Entry>`; a storage or corruption error is reported once
/// and ends the iteration.
pub struct RangeScan<'a> {
    tree: &'a BTree,
    direction: ScanDirection,
    leaf: Option<LeafNode>,
    slot: usize,
    pending: Option<(BlockId, Whence)>,
    done: bool,
}

impl RangeScan<'_> {
    fn step(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }

        if self.leaf.is_none() {
            let Some((block, whence)) = self.pending.take() else {
                self.done = true;
                return Ok(None);
            };
            let leaf = self.tree.read_leaf(block)?;
            let slot = match whence {
                Whence::Slot(slot) => slot,
                Whence::Last => leaf.entries.len() - 1,
            };
            if slot >= leaf.entries.len() {
                self.done = true;
                return Ok(None);
            }
            self.leaf = Some(leaf);
            self.slot = slot;
        }

        let leaf = self.leaf.as_ref().expect("leaf loaded above");
        let entry = leaf.entries[self.slot];

        // Advance past the yielded entry, hopping the sibling link when
        // this leaf is exhausted.
        match self.direction {
            ScanDirection::Ascending => {
                if self.slot + 1 < leaf.entries.len() {
                    self.slot += 1;
                } else {
                    self.pending =
                        (leaf.next != NULL_BLOCK).then_some((leaf.next, Whence::Slot(0)));
                    self.leaf = None;
                    if self.pending.is_none() {
                        self.done = true;
                    }
                }
            }
            ScanDirection::Descending => {
                if self.slot > 0 {
                    self.slot -= 1;
                } else {
                    self.pending =
                        (leaf.prev != NULL_BLOCK).then_some((leaf.prev, Whence::Last));
                    self.leaf = None;
                    if self.pending.is_none() {
                        self.done = true;
                    }
                }
            }
        }

        Ok(Some(entry))
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
