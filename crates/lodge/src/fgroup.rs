//! Day-partitioned file groups: the durable side of the commit pipeline.
//!
//! One file group holds all data committed for one day-file id (`fid`) as a
//! head/data/last triplet:
//!
//! ```text
//! f{fid}.head   block directory: one entry per columnar block, CRC32 guarded
//! f{fid}.data   full-size columnar blocks, appended frame by frame
//! f{fid}.last   small tail blocks, kept apart from the full-size blocks in
//!               the data file
//! ```
//!
//! Commits append; they never rewrite earlier frames. A later commit may
//! therefore carry older timestamps into a group, so the reader merges
//! blocks back into ascending key order (rows with equal timestamps keep
//! their commit order).
//!
//! Every file starts with a 8-byte preamble (4 magic bytes, u16 version, 2
//! reserved). Data and last files carry length+CRC framed blocks; the head
//! file is rewritten atomically at finalize, so a commit that dies mid-file
//! leaves the previous directory intact and any half-appended frames
//! unreferenced.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::commit::DataCols;
use crate::error::{LodgeError, Result};
use crate::types::{RowData, Timestamp};

/// Magic bytes of the head (block directory) file.
pub const HEAD_MAGIC: [u8; 4] = *b"LDGH";
/// Magic bytes of the data file.
pub const DATA_MAGIC: [u8; 4] = *b"LDGD";
/// Magic bytes of the last (small tail blocks) file.
pub const LAST_MAGIC: [u8; 4] = *b"LDGL";

/// Current file-group format version.
pub const FGROUP_VERSION: u16 = 1;

/// Preamble size: magic (4) + version (2) + reserved (2).
const PREAMBLE_SIZE: u64 = 8;

/// Serialized size of one directory entry.
const ENTRY_SIZE: usize = 40;

/// Day-file id of a timestamp, given the ticks spanned by one file.
///
/// Euclidean division keeps pre-epoch timestamps in well-ordered negative
/// file ids.
pub fn fid_of_key(ts: Timestamp, ticks_per_file: i64) -> i64 {
    ts.div_euclid(ticks_per_file)
}

/// Inclusive key range `[min, max]` covered by one day-file id.
pub fn key_range_of_fid(fid: i64, ticks_per_file: i64) -> (Timestamp, Timestamp) {
    let min = fid * ticks_per_file;
    (min, min + ticks_per_file - 1)
}

fn head_path(dir: &Path, fid: i64) -> PathBuf {
    dir.join(format!("f{fid}.head"))
}

fn data_path(dir: &Path, fid: i64) -> PathBuf {
    dir.join(format!("f{fid}.data"))
}

fn last_path(dir: &Path, fid: i64) -> PathBuf {
    dir.join(format!("f{fid}.last"))
}

/// Returns true if a file group exists for `fid` under `dir`.
pub fn fgroup_exists(dir: &Path, fid: i64) -> bool {
    head_path(dir, fid).exists()
}

fn write_preamble(file: &mut File, magic: [u8; 4]) -> Result<()> {
    file.write_all(&magic)?;
    file.write_all(&FGROUP_VERSION.to_le_bytes())?;
    file.write_all(&[0u8; 2])?;
    Ok(())
}

fn check_preamble(file: &mut File, expected: [u8; 4]) -> Result<()> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if magic != expected {
        return Err(LodgeError::InvalidMagic {
            expected,
            actual: magic,
        });
    }
    let mut version = [0u8; 2];
    file.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != FGROUP_VERSION {
        return Err(LodgeError::UnsupportedVersion(version));
    }
    let mut reserved = [0u8; 2];
    file.read_exact(&mut reserved)?;
    Ok(())
}

/// Directory entry describing one committed columnar block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIdx {
    /// Table slot the block belongs to.
    pub tid: u32,
    /// True if the block lives in the last file instead of the data file.
    pub in_last: bool,
    /// Frame offset within its file.
    pub offset: u64,
    /// Frame length in bytes (header plus payload).
    pub len: u32,
    /// Rows in the block.
    pub num_rows: u32,
    /// Smallest timestamp in the block.
    pub key_first: Timestamp,
    /// Largest timestamp in the block.
    pub key_last: Timestamp,
}

impl BlockIdx {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.tid.to_le_bytes());
        buf.push(self.in_last as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
        buf.extend_from_slice(&self.key_first.to_le_bytes());
        buf.extend_from_slice(&self.key_last.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            tid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            in_last: buf[4] != 0,
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            num_rows: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            key_first: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            key_last: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

fn encode_block_payload(cols: &DataCols) -> Vec<u8> {
    let num_rows = cols.num_rows();
    let ncols = cols.ncols() as usize;
    let mut buf = Vec::with_capacity(10 + num_rows * 8 * (1 + ncols));
    buf.extend_from_slice(&(num_rows as u32).to_le_bytes());
    buf.extend_from_slice(&cols.ncols().to_le_bytes());
    buf.extend_from_slice(&cols.schema_version().to_le_bytes());
    for ts in cols.timestamps() {
        buf.extend_from_slice(&ts.to_le_bytes());
    }
    for c in 0..ncols {
        for v in cols.column(c) {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

fn decode_block_payload(buf: &[u8]) -> Result<Vec<RowData>> {
    if buf.len() < 10 {
        return Err(LodgeError::CorruptEncoding(
            "block payload shorter than its header".to_string(),
        ));
    }
    let num_rows = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let ncols = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
    let schema_version = u32::from_le_bytes(buf[6..10].try_into().unwrap());
    let expect = 10 + num_rows * 8 * (1 + ncols);
    if buf.len() != expect {
        return Err(LodgeError::CorruptEncoding(format!(
            "block payload of {} bytes, expected {expect}",
            buf.len()
        )));
    }

    let mut rows = Vec::with_capacity(num_rows);
    for r in 0..num_rows {
        let at = 10 + r * 8;
        let ts = i64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        rows.push(RowData::new(ts, schema_version, Vec::with_capacity(ncols)));
    }
    let cols_base = 10 + num_rows * 8;
    for c in 0..ncols {
        for (r, row) in rows.iter_mut().enumerate() {
            let at = cols_base + (c * num_rows + r) * 8;
            row.values
                .push(f64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
        }
    }
    Ok(rows)
}

fn read_directory(dir: &Path, fid: i64) -> Result<Vec<BlockIdx>> {
    let mut head = File::open(head_path(dir, fid))?;
    check_preamble(&mut head, HEAD_MAGIC)?;

    let mut count = [0u8; 4];
    head.read_exact(&mut count)?;
    let count = u32::from_le_bytes(count) as usize;

    let mut entries = vec![0u8; count * ENTRY_SIZE];
    head.read_exact(&mut entries)?;

    let mut crc = [0u8; 4];
    head.read_exact(&mut crc)?;
    let expected = u32::from_le_bytes(crc);
    let actual = crc32fast::hash(&entries);
    if actual != expected {
        return Err(LodgeError::ChecksumMismatch { expected, actual });
    }

    Ok(entries
        .chunks_exact(ENTRY_SIZE)
        .map(BlockIdx::decode)
        .collect())
}

/// Append-side handle to one file group during a commit.
///
/// Blocks are framed into the data or last file as they arrive; the block
/// directory is only written (and the triplet durable) at [`finalize`].
///
/// [`finalize`]: FileGroupWriter::finalize
#[derive(Debug)]
pub struct FileGroupWriter {
    dir: PathBuf,
    fid: i64,
    data: File,
    last: File,
    data_off: u64,
    last_off: u64,
    blocks: Vec<BlockIdx>,
    last_threshold: usize,
}

impl FileGroupWriter {
    /// Resolves or creates the file group for `fid` and opens it for append.
    ///
    /// Blocks with fewer than `max_rows_per_block / 4` rows are routed to the
    /// last file.
    pub fn open_or_create(dir: &Path, fid: i64, max_rows_per_block: usize) -> Result<Self> {
        let blocks = if fgroup_exists(dir, fid) {
            read_directory(dir, fid)?
        } else {
            let mut data = File::create(data_path(dir, fid))?;
            write_preamble(&mut data, DATA_MAGIC)?;
            let mut last = File::create(last_path(dir, fid))?;
            write_preamble(&mut last, LAST_MAGIC)?;
            // An empty directory marks the group as created even if this
            // commit appends nothing.
            write_head(dir, fid, &[])?;
            Vec::new()
        };

        let mut data = OpenOptions::new().append(true).open(data_path(dir, fid))?;
        let data_off = data.seek(SeekFrom::End(0))?;
        let mut last = OpenOptions::new().append(true).open(last_path(dir, fid))?;
        let last_off = last.seek(SeekFrom::End(0))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            fid,
            data,
            last,
            data_off,
            last_off,
            blocks,
            last_threshold: max_rows_per_block / 4,
        })
    }

    /// Day-file id this writer appends to.
    pub fn fid(&self) -> i64 {
        self.fid
    }

    /// Converts a row batch into a columnar block and appends it.
    ///
    /// Returns the number of rows written (the whole batch, or 0 for an
    /// empty one).
    pub fn append_block(&mut self, tid: u32, cols: &DataCols) -> Result<usize> {
        let num_rows = cols.num_rows();
        if num_rows == 0 {
            return Ok(0);
        }

        let payload = encode_block_payload(cols);
        let crc = crc32fast::hash(&payload);
        let len = 8 + payload.len() as u32;
        let in_last = num_rows < self.last_threshold;

        let (file, offset) = if in_last {
            (&mut self.last, self.last_off)
        } else {
            (&mut self.data, self.data_off)
        };
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
        if in_last {
            self.last_off += len as u64;
        } else {
            self.data_off += len as u64;
        }

        self.blocks.push(BlockIdx {
            tid,
            in_last,
            offset,
            len,
            num_rows: num_rows as u32,
            key_first: cols.key_first(),
            key_last: cols.key_last(),
        });
        Ok(num_rows)
    }

    /// Syncs the block files, rewrites the block directory and closes the
    /// triplet. The group only references the new blocks once this returns.
    pub fn finalize(self) -> Result<()> {
        self.data.sync_all()?;
        self.last.sync_all()?;
        write_head(&self.dir, self.fid, &self.blocks)?;
        debug!(
            fid = self.fid,
            blocks = self.blocks.len(),
            "file group finalized"
        );
        Ok(())
    }
}

fn write_head(dir: &Path, fid: i64, blocks: &[BlockIdx]) -> Result<()> {
    let mut entries = Vec::with_capacity(blocks.len() * ENTRY_SIZE);
    for block in blocks {
        block.encode_into(&mut entries);
    }
    let crc = crc32fast::hash(&entries);

    let mut head = File::create(head_path(dir, fid))?;
    write_preamble(&mut head, HEAD_MAGIC)?;
    head.write_all(&(blocks.len() as u32).to_le_bytes())?;
    head.write_all(&entries)?;
    head.write_all(&crc.to_le_bytes())?;
    head.sync_all()?;
    Ok(())
}

/// Read-side handle to one committed file group.
#[derive(Debug)]
pub struct FileGroupReader {
    dir: PathBuf,
    fid: i64,
    blocks: Vec<BlockIdx>,
}

impl FileGroupReader {
    /// Opens the group for `fid`, reading and verifying its block directory.
    pub fn open(dir: &Path, fid: i64) -> Result<Self> {
        let blocks = read_directory(dir, fid)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            fid,
            blocks,
        })
    }

    /// The verified block directory, in append order.
    pub fn blocks(&self) -> &[BlockIdx] {
        &self.blocks
    }

    /// Reads and decodes every block of one table, merged into ascending
    /// timestamp order.
    ///
    /// Blocks of separate commits may interleave key ranges; rows with equal
    /// timestamps keep their commit order.
    pub fn read_rows(&self, tid: u32) -> Result<Vec<RowData>> {
        let mut data = File::open(data_path(&self.dir, self.fid))?;
        check_preamble(&mut data, DATA_MAGIC)?;
        let mut last = File::open(last_path(&self.dir, self.fid))?;
        check_preamble(&mut last, LAST_MAGIC)?;

        let mut rows = Vec::new();
        for block in self.blocks.iter().filter(|b| b.tid == tid) {
            let file = if block.in_last { &mut last } else { &mut data };
            file.seek(SeekFrom::Start(block.offset))?;

            let mut frame_header = [0u8; 8];
            file.read_exact(&mut frame_header)?;
            let payload_len = u32::from_le_bytes(frame_header[0..4].try_into().unwrap());
            let expected = u32::from_le_bytes(frame_header[4..8].try_into().unwrap());
            assert_eq!(payload_len + 8, block.len, "directory frame length drift");

            let mut payload = vec![0u8; payload_len as usize];
            file.read_exact(&mut payload)?;
            let actual = crc32fast::hash(&payload);
            if actual != expected {
                return Err(LodgeError::ChecksumMismatch { expected, actual });
            }
            rows.extend(decode_block_payload(&payload)?);
        }
        // Stable: ties keep append order, which is commit order.
        rows.sort_by_key(|r| r.ts);
        Ok(rows)
    }
}

/// Drops file groups older than the retention horizon.
///
/// `keep_fids` is the number of day-file ids retained behind `last_fid`;
/// groups with `fid <= last_fid - keep_fids` are removed. Per-group failures
/// are logged and the sweep continues. Returns the number of groups dropped.
pub fn apply_retention(dir: &Path, last_fid: i64, keep_fids: u32) -> Result<usize> {
    let horizon = last_fid - keep_fids as i64;
    let mut dropped = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(fid) = name
            .to_str()
            .and_then(|n| n.strip_prefix('f'))
            .and_then(|n| n.strip_suffix(".head"))
            .and_then(|n| n.parse::<i64>().ok())
        else {
            continue;
        };
        if fid > horizon {
            continue;
        }
        let mut failed = false;
        for path in [head_path(dir, fid), data_path(dir, fid), last_path(dir, fid)] {
            if let Err(err) = fs::remove_file(&path) {
                error!(fid, path = %path.display(), %err, "retention drop failed");
                failed = true;
            }
        }
        if !failed {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(dropped, horizon, "retention sweep removed expired file groups");
    }
    Ok(dropped)
}
