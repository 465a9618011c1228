//! Fixed-size block storage file
//!
//! ## Design
//! - **Block-addressed**: the file is an array of fixed-size blocks; block 0
//!   holds the file header, blocks 1.. hold index nodes
//! - **Append-only allocation**: `alloc` extends the file by one zeroed block
//!   and hands back its address; blocks are never reclaimed
//! - **Durable header**: magic, version, block length, block count and the
//!   index root address live in block 0, protected by a CRC32 checksum
//!
//! ## File layout
//! ```text
//! [Block 0: FileHeader (bincode, zero-padded to block_length)]
//! [Block 1: node]
//! [Block 2: node]
//! ...
//! ```
//!
//! Reads and writes go through a single file handle behind a mutex, so
//! concurrent readers are safe without any coordination of their own.

use crate::{IndexError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Address of one block inside a `BlockFile`.
pub type BlockId = u64;

/// Block 0 is reserved for the file header.
pub const HEADER_BLOCK: BlockId = 0;

/// Null block address. Block 0 can never hold a node, so 0 doubles as the
/// "no such block" sentinel for sibling links and an unset root.
pub const NULL_BLOCK: BlockId = 0;

/// Magic number for block files (ASCII "QLSH")
const FILE_MAGIC: u32 = 0x514C_5348;

/// Current file format version
const FILE_VERSION: u32 = 1;

/// Serialized size of `FileHeader` (bincode, fixed-width integers)
const HEADER_ENCODED_LEN: usize = 32;

/// File header stored in block 0.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct FileHeader {
    /// Magic number for file validation
    magic: u32,

    /// Format version
    version: u32,

    /// Fixed block size this file was created with
    block_length: u32,

    /// Total number of blocks, header block included
    num_blocks: u64,

    /// Root block address of the index, NULL_BLOCK until constructed
    root: u64,

    /// CRC32 over the preceding fields
    checksum: u32,
}

impl FileHeader {
    fn compute_checksum(&self) -> Result<u32> {
        let mut plain = self.clone();
        plain.checksum = 0;
        let bytes = bincode::serialize(&plain)?;
        Ok(crc32fast::hash(&bytes))
    }
}

/// Fixed-size block storage file.
///
/// A `BlockFile` hands out opaque block addresses; callers resolve every
/// node-to-node reference through `read`/`write` rather than in-memory
/// pointers, which keeps the structure valid across process restarts.
pub struct BlockFile {
    /// Storage file (seek + read/write under the lock)
    file: Mutex<File>,

    /// Fixed block size in bytes
    block_length: usize,

    /// Total blocks in the file, header block included
    num_blocks: RwLock<u64>,

    /// Root block address persisted in the header
    root: RwLock<BlockId>,
}

impl BlockFile {
    /// Create a new block file, truncating any existing file at `path`.
    ///
    /// Fails with `Config` if `block_length` cannot hold the header.
    pub fn create<P: AsRef<Path>>(path: P, block_length: usize) -> Result<Self> {
        if block_length < HEADER_ENCODED_LEN {
            return Err(IndexError::Config(format!(
                "block length {} cannot hold the {}-byte file header",
                block_length, HEADER_ENCODED_LEN
            )));
        }

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let block_file = Self {
            file: Mutex::new(file),
            block_length,
            num_blocks: RwLock::new(1),
            root: RwLock::new(NULL_BLOCK),
        };
        block_file.write_header()?;

        Ok(block_file)
    }

    /// Open an existing block file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_ENCODED_LEN as u64 {
            return Err(IndexError::CorruptHeader(format!(
                "file too short to hold a header: {} bytes",
                file_len
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; HEADER_ENCODED_LEN];
        file.read_exact(&mut buf)?;

        let header: FileHeader = bincode::deserialize(&buf)
            .map_err(|e| IndexError::CorruptHeader(format!("undecodable header: {}", e)))?;

        if header.magic != FILE_MAGIC {
            return Err(IndexError::CorruptHeader(format!(
                "bad magic number: expected 0x{:08X}, got 0x{:08X}",
                FILE_MAGIC, header.magic
            )));
        }
        if header.version != FILE_VERSION {
            return Err(IndexError::CorruptHeader(format!(
                "unsupported format version: {}",
                header.version
            )));
        }
        if header.checksum != header.compute_checksum()? {
            return Err(IndexError::CorruptHeader(
                "header checksum mismatch".into(),
            ));
        }

        let block_length = header.block_length as usize;
        if block_length < HEADER_ENCODED_LEN {
            return Err(IndexError::CorruptHeader(format!(
                "implausible block length: {}",
                block_length
            )));
        }
        if file_len != header.num_blocks * block_length as u64 {
            return Err(IndexError::CorruptHeader(format!(
                "file length {} does not match {} blocks of {} bytes",
                file_len, header.num_blocks, block_length
            )));
        }

        Ok(Self {
            file: Mutex::new(file),
            block_length,
            num_blocks: RwLock::new(header.num_blocks),
            root: RwLock::new(header.root),
        })
    }

    /// Fixed block size of this file.
    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Total number of blocks, header block included.
    pub fn num_blocks(&self) -> u64 {
        *self.num_blocks.read()
    }

    /// Root block address recorded in the header.
    pub fn root(&self) -> BlockId {
        *self.root.read()
    }

    /// Record a new root address and rewrite the header block.
    pub fn set_root(&self, root: BlockId) -> Result<()> {
        *self.root.write() = root;
        self.write_header()
    }

    /// Read one block. The header block cannot be read as a node.
    pub fn read(&self, id: BlockId) -> Result<Vec<u8>> {
        self.check_block(id)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(id * self.block_length as u64))?;

        let mut buf = vec![0u8; self.block_length];
        file.read_exact(&mut buf).map_err(|e| {
            IndexError::Storage(format!("short read of block {}: {}", id, e))
        })?;

        Ok(buf)
    }

    /// Write one block. `buf` must be exactly one block long.
    pub fn write(&self, id: BlockId, buf: &[u8]) -> Result<()> {
        self.check_block(id)?;
        if buf.len() != self.block_length {
            return Err(IndexError::Storage(format!(
                "block write of {} bytes, expected {}",
                buf.len(),
                self.block_length
            )));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(id * self.block_length as u64))?;
        file.write_all(buf)?;

        Ok(())
    }

    /// Allocate a new zeroed block at the end of the file.
    pub fn alloc(&self) -> Result<BlockId> {
        let mut num_blocks = self.num_blocks.write();
        let id = *num_blocks;

        let zeroes = vec![0u8; self.block_length];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(id * self.block_length as u64))?;
        file.write_all(&zeroes)?;
        drop(file);

        *num_blocks += 1;
        Ok(id)
    }

    /// Flush all written blocks to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn check_block(&self, id: BlockId) -> Result<()> {
        if id == HEADER_BLOCK {
            return Err(IndexError::Storage(
                "block 0 is reserved for the file header".into(),
            ));
        }
        if id >= self.num_blocks() {
            return Err(IndexError::Storage(format!(
                "block address {} out of range ({} blocks)",
                id,
                self.num_blocks()
            )));
        }
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let mut header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            block_length: self.block_length as u32,
            num_blocks: *self.num_blocks.read(),
            root: *self.root.read(),
            checksum: 0,
        };
        header.checksum = header.compute_checksum()?;

        let encoded = bincode::serialize(&header)?;
        let mut buf = vec![0u8; self.block_length];
        buf[..encoded.len()].copy_from_slice(&encoded);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn create_test_file(block_length: usize) -> (BlockFile, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.blocks");
        let file = BlockFile::create(path, block_length).unwrap();
        (file, temp_dir)
    }

    #[test]
    fn test_create_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reopen.blocks");

        {
            let file = BlockFile::create(&path, 128).unwrap();
            let id = file.alloc().unwrap();
            file.write(id, &[7u8; 128]).unwrap();
            file.set_root(id).unwrap();
            file.sync().unwrap();
        }

        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.block_length(), 128);
        assert_eq!(file.num_blocks(), 2);
        assert_eq!(file.root(), 1);
        assert_eq!(file.read(1).unwrap(), vec![7u8; 128]);
    }

    #[test]
    fn test_block_length_too_small() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tiny.blocks");
        let result = BlockFile::create(path, 8);
        assert!(matches!(result, Err(IndexError::Config(_))));
    }

    #[test]
    fn test_alloc_returns_consecutive_addresses() {
        let (file, _temp) = create_test_file(64);
        assert_eq!(file.alloc().unwrap(), 1);
        assert_eq!(file.alloc().unwrap(), 2);
        assert_eq!(file.alloc().unwrap(), 3);
        assert_eq!(file.num_blocks(), 4);
    }

    #[test]
    fn test_header_block_rejected_for_node_io() {
        let (file, _temp) = create_test_file(64);
        assert!(file.read(HEADER_BLOCK).is_err());
        assert!(file.write(HEADER_BLOCK, &[0u8; 64]).is_err());
    }

    #[test]
    fn test_out_of_range_read() {
        let (file, _temp) = create_test_file(64);
        let result = file.read(42);
        assert!(matches!(result, Err(IndexError::Storage(_))));
    }

    #[test]
    fn test_wrong_buffer_length_rejected() {
        let (file, _temp) = create_test_file(64);
        let id = file.alloc().unwrap();
        assert!(file.write(id, &[0u8; 63]).is_err());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("badmagic.blocks");
        BlockFile::create(&path, 64).unwrap();

        // Flip a byte inside the magic number.
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xFF;
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&raw).unwrap();

        let result = BlockFile::open(&path);
        assert!(matches!(result, Err(IndexError::CorruptHeader(_))));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("truncated.blocks");
        {
            let file = BlockFile::create(&path, 64).unwrap();
            file.alloc().unwrap();
            file.set_root(1).unwrap();
            file.sync().unwrap();
        }

        // Chop off half of the last block.
        let raw = std::fs::read(&path).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&raw[..raw.len() - 32]).unwrap();

        let result = BlockFile::open(&path);
        assert!(matches!(result, Err(IndexError::CorruptHeader(_))));
    }

    #[test]
    fn test_open_rejects_corrupted_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("badsum.blocks");
        BlockFile::create(&path, 64).unwrap();

        // Corrupt the stored root field without updating the checksum.
        let mut raw = std::fs::read(&path).unwrap();
        raw[20] ^= 0xFF;
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&raw).unwrap();

        let result = BlockFile::open(&path);
        assert!(matches!(result, Err(IndexError::CorruptHeader(_))));
    }
}
