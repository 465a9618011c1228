//! Storage layer implementation
//!
//! Fixed-size block storage underneath the index structures.

pub mod block_file;

pub use block_file::{BlockFile, BlockId, HEADER_BLOCK, NULL_BLOCK};
