//! # Checkpoint
//!
//! A checkpoint is a logical snapshot of one index: its name, its kind
//! and every live row, in order. It is what [`restore`] bulk-loads into a
//! fresh index.
//!
//! ## File layout
//!
//! ```text
//! +---------------------------------------------------------------+
//! | header: magic "FDXC" | version | name | unique | rows | blocks |
//! |         header_crc32 (computed with the field zeroed)          |
//! +---------------------------------------------------------------+
//! | block 0: [u32 payload len][u32 crc32][payload: rows]          |
//! | block 1: ...                                                  |
//! +---------------------------------------------------------------+
//! ```
//!
//! Rows are encoded as `[key bytes][u64 row id]` and grouped
//! [`ROWS_PER_BLOCK`] to a block. Every block carries its own CRC so a
//! corrupted byte anywhere in the file is detected on read.
//!
//! ## Atomicity
//!
//! The file is written to `<path>.tmp`, fsynced and renamed into place,
//! so a reader sees either the previous checkpoint or the complete new one.
//!
//! ## Consistency
//!
//! [`write`] holds a table-level shared lock for the duration of the
//! snapshot. That lock waits for transactions with pending changes on the
//! index to finish and keeps new writers out, so every delete mark still
//! on a page belongs to a committed delete and is left out of the file.


use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info};

use crate::btree::{BTree, IndexKind, TreeError};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::lock::{LockError, LockMode, LockTarget};
use crate::page::{IndexRow, RowId};
use crate::txn::TxnCtx;

const CHECKPOINT_MAGIC: [u8; 4] = *b"FDXC";
const CHECKPOINT_VERSION: u32 = 1;

/// Rows per CRC-protected block.
pub const ROWS_PER_BLOCK: usize = 256;

/// Size of a block's `[len][crc]` prefix.
const BLOCK_PREFIX_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Contents of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: String,
    pub kind: IndexKind,
    pub rows: Vec<IndexRow>,
}

impl Checkpoint {
    /// Largest row id in the snapshot.
    pub fn max_row_id(&self) -> Option<RowId> {
        self.rows.iter().map(|r| r.row).max()
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct CheckpointHeader {
    magic: [u8; 4],
    version: u32,
    name: String,
    unique: bool,
    row_count: u64,
    block_count: u32,
    header_crc: u32,
}

impl CheckpointHeader {
    fn checksum(&self) -> Result<u32, EncodingError> {
        let mut zeroed = encoding::encode_to_vec(self)?;
        let crc_at = zeroed.len() - 4;
        zeroed[crc_at..].fill(0);
        let mut hasher = Crc32::new();
        hasher.update(&zeroed);
        Ok(hasher.finalize())
    }
}

impl Encode for CheckpointHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.name.encode_to(buf)?;
        self.unique.encode_to(buf)?;
        self.row_count.encode_to(buf)?;
        self.block_count.encode_to(buf)?;
        self.header_crc.encode_to(buf)
    }
}

impl Decode for CheckpointHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut off) = <[u8; 4]>::decode_from(buf)?;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (unique, n) = bool::decode_from(&buf[off..])?;
        off += n;
        let (row_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (block_count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (header_crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                name,
                unique,
                row_count,
                block_count,
                header_crc,
            },
            off,
        ))
    }
}

impl Encode for IndexRow {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.row.0.encode_to(buf)
    }
}

impl Decode for IndexRow {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, off) = Vec::<u8>::decode_from(buf)?;
        let (row, n) = u64::decode_from(&buf[off..])?;
        Ok((IndexRow::new(key, RowId(row)), off + n))
    }
}

fn block_crc(payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Write
// ------------------------------------------------------------------------------------------------

/// Writes a checkpoint of `tree` to `path`. Returns the number of rows.
pub(crate) fn write(tree: &BTree, path: &Path, ctx: &TxnCtx<'_>) -> Result<usize, CheckpointError> {
    let table = LockTarget::Table(tree.table_id());
    ctx.lock_wait(table, LockMode::Shared)?;
    let res = snapshot_to_file(tree, path, ctx);
    ctx.unlock(table);
    res
}

fn snapshot_to_file(tree: &BTree, path: &Path, ctx: &TxnCtx<'_>) -> Result<usize, CheckpointError> {
    let rows: Vec<IndexRow> = tree
        .entries(ctx.interrupt)?
        .into_iter()
        .filter(|e| !e.deleted)
        .map(|e| e.row)
        .collect();

    let blocks: Vec<&[IndexRow]> = rows.chunks(ROWS_PER_BLOCK).collect();
    let block_count = u32::try_from(blocks.len())
        .map_err(|_| CheckpointError::Corrupt(format!("{} blocks do not fit the header", blocks.len())))?;

    let mut header = CheckpointHeader {
        magic: CHECKPOINT_MAGIC,
        version: CHECKPOINT_VERSION,
        name: tree.name().to_string(),
        unique: tree.kind() == IndexKind::Unique,
        row_count: rows.len() as u64,
        block_count,
        header_crc: 0,
    };
    header.header_crc = header.checksum()?;

    let mut buf = encoding::encode_to_vec(&header)?;
    for block in &blocks {
        let mut payload = Vec::new();
        encoding::encode_vec(block, &mut payload)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CheckpointError::Corrupt("block exceeds u32::MAX bytes".into()))?;
        len.encode_to(&mut buf)?;
        block_crc(&payload).encode_to(&mut buf)?;
        buf.extend_from_slice(&payload);
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }

    info!(
        index = %tree.name(),
        path = %path.display(),
        rows = rows.len(),
        blocks = blocks.len(),
        bytes = buf.len(),
        "checkpoint written"
    );
    Ok(rows.len())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ------------------------------------------------------------------------------------------------
// Read
// ------------------------------------------------------------------------------------------------

/// Reads and verifies a checkpoint file.
pub fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(CheckpointError::Corrupt("empty file".into()));
    }
    // SAFETY: the file is complete once renamed into place and never
    // modified afterwards; the mapping is read-only and every slice
    // below is bounds-checked against its length.
    let mmap = unsafe { Mmap::map(&file)? };
    parse(&mmap)
}

fn parse(buf: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let (header, mut off) = encoding::decode_from_slice::<CheckpointHeader>(buf)
        .map_err(|e| CheckpointError::Corrupt(format!("unreadable header: {e}")))?;
    if header.header_crc != header.checksum()? {
        return Err(CheckpointError::ChecksumMismatch("header".into()));
    }
    if header.magic != CHECKPOINT_MAGIC {
        return Err(CheckpointError::Corrupt("bad magic".into()));
    }
    if header.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::Corrupt(format!(
            "unsupported version {}",
            header.version
        )));
    }

    let mut rows = Vec::new();
    for block in 0..header.block_count {
        if buf.len() - off < BLOCK_PREFIX_SIZE {
            return Err(CheckpointError::Corrupt(format!("block {block} truncated")));
        }
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let len = len as usize;
        if buf.len() - off < len {
            return Err(CheckpointError::Corrupt(format!("block {block} truncated")));
        }
        let payload = &buf[off..off + len];
        if block_crc(payload) != crc {
            return Err(CheckpointError::ChecksumMismatch(format!("block {block}")));
        }
        let (mut block_rows, used) = encoding::decode_vec::<IndexRow>(payload)?;
        if used != len {
            return Err(CheckpointError::Corrupt(format!("block {block} has trailing bytes")));
        }
        rows.append(&mut block_rows);
        off += len;
    }

    if off != buf.len() {
        return Err(CheckpointError::Corrupt("trailing bytes after last block".into()));
    }
    if rows.len() as u64 != header.row_count {
        return Err(CheckpointError::Corrupt(format!(
            "header says {} rows, blocks hold {}",
            header.row_count,
            rows.len()
        )));
    }
    if rows.windows(2).any(|w| w[0] >= w[1]) {
        return Err(CheckpointError::Corrupt("rows out of order".into()));
    }

    debug!(index = %header.name, rows = rows.len(), "checkpoint read");
    Ok(Checkpoint {
        name: header.name,
        kind: if header.unique {
            IndexKind::Unique
        } else {
            IndexKind::NonUnique
        },
        rows,
    })
}
