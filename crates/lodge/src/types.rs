//! Core data types shared by the write buffer and the commit pipeline.
//!
//! A [`Table`] is a handle supplied by the catalog layer: it carries a stable
//! slot id (`tid`), a unique id distinguishing reused slots (`uid`) and the
//! table's schema versions. A [`RowData`] is a schema-versioned tuple keyed
//! by timestamp; rows are copied by value into slab storage at insertion and
//! never mutated afterwards.

use crate::error::{LodgeError, Result};

/// Timestamp in the repository's configured precision.
pub type Timestamp = i64;

/// Encoded row header: timestamp (8) + schema version (4) + column count (2).
pub const ROW_HEADER_SIZE: usize = 14;

/// Clock precision of all timestamps stored in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Milliseconds since the epoch.
    #[default]
    Millis,
    /// Microseconds since the epoch.
    Micros,
    /// Nanoseconds since the epoch.
    Nanos,
}

impl Precision {
    /// Number of timestamp ticks in one day at this precision.
    pub fn ticks_per_day(self) -> i64 {
        match self {
            Precision::Millis => 86_400_000,
            Precision::Micros => 86_400_000_000,
            Precision::Nanos => 86_400_000_000_000,
        }
    }
}

/// One version of a table's schema.
///
/// Only the metrics the write path needs are kept: the version number and the
/// number of value columns (the timestamp column is implicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    version: u32,
    ncols: u16,
}

impl Schema {
    /// Creates a schema with the given version and value-column count.
    pub fn new(version: u32, ncols: u16) -> Self {
        Self { version, ncols }
    }

    /// Schema version number.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of value columns.
    pub fn ncols(&self) -> u16 {
        self.ncols
    }

    /// Encoded size of a full-width row under this schema.
    pub fn row_size(&self) -> usize {
        ROW_HEADER_SIZE + self.ncols as usize * 8
    }
}

/// Catalog-owned table handle consumed by the write path.
///
/// Table slots are reused after drop/recreate, so a stale in-memory index is
/// detected by comparing `uid`, never by slot absence.
#[derive(Debug, Clone)]
pub struct Table {
    tid: usize,
    uid: u64,
    schemas: Vec<Schema>,
}

impl Table {
    /// Creates a table handle with its initial schema.
    pub fn new(tid: usize, uid: u64, schema: Schema) -> Self {
        Self {
            tid,
            uid,
            schemas: vec![schema],
        }
    }

    /// Registers a newer schema version. Versions must be added in
    /// ascending order.
    pub fn add_schema(&mut self, schema: Schema) {
        assert!(
            schema.version > self.schema().version,
            "schema versions must ascend"
        );
        self.schemas.push(schema);
    }

    /// Stable slot id of this table within its repository.
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Unique id distinguishing reused slots.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Current (latest) schema.
    pub fn schema(&self) -> &Schema {
        self.schemas.last().expect("table has at least one schema")
    }

    /// Looks up a historical schema by version number.
    pub fn schema_by_version(&self, version: u32) -> Result<&Schema> {
        self.schemas
            .iter()
            .find(|s| s.version == version)
            .ok_or(LodgeError::SchemaVersionNotFound {
                uid: self.uid,
                version,
            })
    }
}

/// Ordering key of a buffered row: timestamp plus an insertion-sequence
/// disambiguator, so rows with equal timestamps stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowKey {
    /// Row timestamp in repository precision.
    pub ts: Timestamp,
    /// Repository-wide insertion sequence number.
    pub seq: u64,
}

impl RowKey {
    /// Creates a tuple key.
    pub fn new(ts: Timestamp, seq: u64) -> Self {
        Self { ts, seq }
    }
}

/// A schema-versioned row tuple: one timestamp plus the value columns of the
/// schema version it was written under.
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    /// Row timestamp.
    pub ts: Timestamp,
    /// Schema version the values were written under.
    pub schema_version: u32,
    /// Value columns, one per schema column.
    pub values: Vec<f64>,
}

impl RowData {
    /// Creates a row.
    pub fn new(ts: Timestamp, schema_version: u32, values: Vec<f64>) -> Self {
        Self {
            ts,
            schema_version,
            values,
        }
    }

    /// Size of this row once encoded into slab storage.
    pub fn encoded_len(&self) -> usize {
        ROW_HEADER_SIZE + self.values.len() * 8
    }

    /// Encodes the row into `buf`, which must be exactly `encoded_len` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.encoded_len());
        buf[0..8].copy_from_slice(&self.ts.to_le_bytes());
        buf[8..12].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[12..14].copy_from_slice(&(self.values.len() as u16).to_le_bytes());
        for (i, v) in self.values.iter().enumerate() {
            let at = ROW_HEADER_SIZE + i * 8;
            buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Decodes a row from slab storage.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ROW_HEADER_SIZE {
            return Err(LodgeError::CorruptEncoding(format!(
                "row buffer too short: {} bytes",
                buf.len()
            )));
        }
        let ts = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let schema_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let ncols = u16::from_le_bytes(buf[12..14].try_into().unwrap()) as usize;
        if buf.len() != ROW_HEADER_SIZE + ncols * 8 {
            return Err(LodgeError::CorruptEncoding(format!(
                "row buffer of {} bytes does not match {} columns",
                buf.len(),
                ncols
            )));
        }
        let mut values = Vec::with_capacity(ncols);
        for i in 0..ncols {
            let at = ROW_HEADER_SIZE + i * 8;
            values.push(f64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
        }
        Ok(Self {
            ts,
            schema_version,
            values,
        })
    }
}
