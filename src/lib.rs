//! QALSH Index Core
//!
//! Disk-resident B+tree indexing the hash tables produced by a query-aware
//! LSH (QALSH) approximate-nearest-neighbor engine. For each hash function
//! the engine emits a sorted table of (hash projection value, object id)
//! pairs; this crate persists that table in fixed-size disk blocks and
//! exposes it as an ordered sequence that can be entered at any key and
//! walked forward or backward one entry at a time.
//!
//! ## Architecture
//! - Storage layer: fixed-size block file with a checksummed header block
//! - Index layer: bulk-constructed, read-only B+tree with a doubly linked
//!   leaf chain and a lazily cached root node
//!
//! ## Lifecycle
//! ```no_run
//! use qalsh_index::{BTree, Entry, ScanDirection};
//!
//! # fn main() -> qalsh_index::Result<()> {
//! // Construction pipeline: build once from a sorted table.
//! let tree = BTree::create(4096, "table_0.idx")?;
//! let table = vec![Entry::new(0.1, 1), Entry::new(0.9, 2)];
//! tree.bulk_construct(&table)?;
//!
//! // Query side: restore, seed a scan, walk until done.
//! let tree = BTree::restore("table_0.idx")?;
//! if let Some(pos) = tree.locate(0.5, ScanDirection::Ascending)? {
//!     for entry in tree.scan(pos, ScanDirection::Ascending) {
//!         let _entry = entry?; // collision counting happens here
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod index;
pub mod storage;

mod error;

pub use error::{IndexError, Result};
pub use index::{BTree, Entry, Position, RangeScan, ScanDirection};
pub use storage::{BlockFile, BlockId, NULL_BLOCK};
