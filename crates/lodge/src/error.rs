//! Error and Result types for Lodge operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Lodge operations.
pub type Result<T> = std::result::Result<T, LodgeError>;

/// The error type for write-buffer and commit operations.
#[derive(Debug, Error)]
pub enum LodgeError {
    /// The pool cannot supply another block and no outstanding commit will
    /// return one.
    ///
    /// Recoverable: the caller may retry once buffered data has been
    /// flushed.
    #[error("Buffer pool exhausted, cannot allocate row storage")]
    BufferExhausted,

    /// The table slot id is outside the configured table range.
    #[error("Table slot {tid} out of range (max_tables {max_tables})")]
    TableSlotOutOfRange {
        /// Offending table slot id.
        tid: usize,
        /// Configured number of table slots.
        max_tables: usize,
    },

    /// A single encoded row does not fit into one buffer block.
    #[error("Row of {bytes} bytes exceeds buffer block size {block_size}")]
    RowTooLarge {
        /// Encoded row size.
        bytes: usize,
        /// Configured block size.
        block_size: usize,
    },

    /// The commit thread could not be spawned.
    ///
    /// Fatal for the repository: the retired generation stays referenced by
    /// the immutable slot and its rows are never silently dropped.
    #[error("Failed to spawn commit thread: {0}")]
    CommitSpawn(#[source] io::Error),

    /// Invalid magic bytes in a file-group file.
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Magic the file kind requires.
        expected: [u8; 4],
        /// Magic actually read.
        actual: [u8; 4],
    },

    /// Unsupported file-group format version.
    #[error("Unsupported file format version: {0}")]
    UnsupportedVersion(u16),

    /// A block or directory checksum does not match.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A row's value count does not match its declared schema version.
    #[error("Row with {ncols} values does not match schema version {version} ({expected} columns)")]
    RowSchemaMismatch {
        /// Schema version the row declares.
        version: u32,
        /// Column count of that schema version.
        expected: u16,
        /// Value count the row actually carries.
        ncols: usize,
    },

    /// A row carries a schema version the table does not know.
    #[error("Schema version {version} not found for table uid {uid}")]
    SchemaVersionNotFound {
        /// Unique id of the table.
        uid: u64,
        /// Unknown schema version.
        version: u32,
    },

    /// A row or block could not be decoded.
    #[error("Corrupt encoding: {0}")]
    CorruptEncoding(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
