//! Memory table: one generation of buffered writes for a repository.
//!
//! A [`MemTable`] owns the buffer blocks borrowed from the pool for one
//! buffering interval, plus one lazily-created [`TableData`] index per table
//! slot and the aggregate statistics (row count, key range, widest schema
//! seen) the commit pipeline sizes its batch buffer from. The active
//! generation accepts writes; once swapped out it becomes immutable and is
//! only read by the commit task, so no synchronization lives here.

use std::sync::Arc;

use tracing::warn;

use crate::error::{LodgeError, Result};
use crate::mem::pool::BufBlock;
use crate::mem::skiplist::{RowRef, SkipList, SkipListIter};
use crate::types::{RowData, RowKey, Table, Timestamp};

/// Buffered rows of a single table within one generation.
///
/// Carries the unique id of the table it was created for: table slots are
/// reused after drop/recreate, and a stale index is detected by uid mismatch,
/// never by slot absence.
#[derive(Debug)]
pub struct TableData {
    uid: u64,
    table: Arc<Table>,
    index: SkipList,
    key_first: Timestamp,
    key_last: Timestamp,
    num_rows: u64,
}

impl TableData {
    fn new(table: &Arc<Table>) -> Self {
        Self {
            uid: table.uid(),
            table: Arc::clone(table),
            index: SkipList::new(),
            key_first: Timestamp::MAX,
            key_last: Timestamp::MIN,
            num_rows: 0,
        }
    }

    /// Unique id of the table this index was created for.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Table handle captured at index creation.
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Number of buffered rows.
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Smallest buffered timestamp, or `Timestamp::MAX` when empty.
    pub fn key_first(&self) -> Timestamp {
        self.key_first
    }

    /// Largest buffered timestamp, or `Timestamp::MIN` when empty.
    pub fn key_last(&self) -> Timestamp {
        self.key_last
    }

    /// Forward cursor over the buffered rows in ascending key order.
    pub fn iter(&self) -> SkipListIter<'_> {
        self.index.iter()
    }
}

/// One generation of in-memory write state.
#[derive(Debug)]
pub struct MemTable {
    blocks: Vec<BufBlock>,
    tables: Vec<Option<TableData>>,
    key_first: Timestamp,
    key_last: Timestamp,
    num_rows: u64,
    max_cols: u16,
}

impl MemTable {
    /// Creates an empty generation with `max_tables` index slots and no
    /// blocks; the repository appends the first block before inserting.
    pub fn new(max_tables: usize) -> Self {
        let mut tables = Vec::with_capacity(max_tables);
        tables.resize_with(max_tables, || None);
        Self {
            blocks: Vec::new(),
            tables,
            key_first: Timestamp::MAX,
            key_last: Timestamp::MIN,
            num_rows: 0,
            max_cols: 0,
        }
    }

    /// Number of buffer blocks this generation has borrowed from the pool.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total rows across all tables.
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Smallest timestamp seen, or `Timestamp::MAX` when empty.
    pub fn key_first(&self) -> Timestamp {
        self.key_first
    }

    /// Largest timestamp seen, or `Timestamp::MIN` when empty.
    pub fn key_last(&self) -> Timestamp {
        self.key_last
    }

    /// Largest value-column count observed across all schema versions written.
    pub fn max_cols(&self) -> u16 {
        self.max_cols
    }

    /// Appends a block borrowed from the pool; it becomes the tail the slab
    /// allocator bumps into.
    pub fn push_block(&mut self, block: BufBlock) {
        self.blocks.push(block);
    }

    /// Remaining capacity of the tail block, or 0 when no block is held.
    pub fn tail_remain(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.remain())
    }

    /// Borrows the index of one table slot, if present.
    pub fn table_data(&self, tid: usize) -> Option<&TableData> {
        self.tables.get(tid).and_then(|t| t.as_ref())
    }

    /// Borrows the encoded bytes of one row.
    pub fn row_bytes(&self, row: RowRef) -> &[u8] {
        self.blocks[row.block as usize].bytes(row.offset as usize, row.len as usize)
    }

    /// Copies `row` into the tail block and links it into the table's index.
    ///
    /// The caller has already secured tail capacity for the encoded row; a
    /// shortfall here is an internal inconsistency. If the slot holds an
    /// index for a dropped/recreated table (uid mismatch) the stale index is
    /// discarded and a fresh one created.
    ///
    /// Returns true if the key was newly inserted; on an exact tuple-key
    /// duplicate the slab allocation is rolled back and false returned.
    pub fn insert_row(&mut self, table: &Arc<Table>, row: &RowData, seq: u64) -> Result<bool> {
        let schema = table.schema_by_version(row.schema_version)?;

        let bytes = row.encoded_len();
        if bytes != schema.row_size() {
            return Err(LodgeError::RowSchemaMismatch {
                version: row.schema_version,
                expected: schema.ncols(),
                ncols: row.values.len(),
            });
        }
        let mut buf = vec![0u8; bytes];
        row.encode_into(&mut buf);

        let block = self.blocks.len() - 1;
        let tail = self.blocks.last_mut().expect("active generation has a tail block");
        let offset = tail.append(&buf).expect("tail capacity secured by caller");
        let rref = RowRef {
            block: block as u32,
            offset: offset as u32,
            len: bytes as u32,
        };

        let tid = table.tid();
        if let Some(stale) = &self.tables[tid] {
            if stale.uid() != table.uid() {
                // Reused slot: the old table was dropped, its buffered rows
                // go with it.
                warn!(
                    tid,
                    old_uid = stale.uid(),
                    new_uid = table.uid(),
                    dropped_rows = stale.num_rows(),
                    "discarding stale table index for reused slot"
                );
                self.num_rows -= stale.num_rows();
                self.tables[tid] = None;
            }
        }
        let tdata = self.tables[tid].get_or_insert_with(|| TableData::new(table));

        let key = RowKey::new(row.ts, seq);
        if !tdata.index.insert(key, rref) {
            self.blocks[block].rollback(bytes);
            return Ok(false);
        }

        tdata.num_rows += 1;
        tdata.key_first = tdata.key_first.min(row.ts);
        tdata.key_last = tdata.key_last.max(row.ts);
        assert_eq!(tdata.num_rows, tdata.index.len() as u64);

        self.num_rows += 1;
        self.key_first = self.key_first.min(row.ts);
        self.key_last = self.key_last.max(row.ts);
        self.max_cols = self.max_cols.max(schema.ncols());

        Ok(true)
    }

    /// Checks the row-count and key-range invariants; must hold directly
    /// before teardown.
    pub fn assert_consistent(&self) {
        let mut total = 0u64;
        for tdata in self.tables.iter().flatten() {
            total += tdata.num_rows();
            if tdata.num_rows() > 0 {
                assert!(tdata.key_first() >= self.key_first);
                assert!(tdata.key_last() <= self.key_last);
            }
        }
        assert_eq!(total, self.num_rows, "generation row count out of sync");
    }

    /// Hands every buffer block back to the caller for return to the pool
    /// and drops all table indexes.
    ///
    /// Idempotent: a second call finds nothing to release and returns an
    /// empty list.
    pub fn release_blocks(&mut self) -> Vec<BufBlock> {
        for slot in &mut self.tables {
            *slot = None;
        }
        std::mem::take(&mut self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schema;

    fn table(tid: usize, uid: u64, ncols: u16) -> Arc<Table> {
        Arc::new(Table::new(tid, uid, Schema::new(1, ncols)))
    }

    fn mem_with_block(max_tables: usize) -> MemTable {
        let mut mem = MemTable::new(max_tables);
        mem.push_block(BufBlock::new(4096));
        mem
    }

    fn row(ts: i64, values: Vec<f64>) -> RowData {
        RowData::new(ts, 1, values)
    }

    #[test]
    fn test_insert_updates_counts_and_ranges() {
        let mut mem = mem_with_block(4);
        let t = table(2, 100, 2);

        // Duplicate timestamp 1 is written twice, each a distinct row.
        for (seq, ts) in [3i64, 1, 4, 1, 5].into_iter().enumerate() {
            assert!(mem.insert_row(&t, &row(ts, vec![1.0, 2.0]), seq as u64).unwrap());
        }

        let tdata = mem.table_data(2).unwrap();
        assert_eq!(tdata.num_rows(), 5);
        assert_eq!(mem.num_rows(), 5);
        assert_eq!(mem.key_first(), 1);
        assert_eq!(mem.key_last(), 5);
        assert_eq!(tdata.key_first(), 1);
        assert_eq!(tdata.key_last(), 5);
        assert_eq!(mem.max_cols(), 2);
        mem.assert_consistent();
    }

    #[test]
    fn test_row_bytes_round_trip() {
        let mut mem = mem_with_block(1);
        let t = table(0, 7, 1);
        let r = row(42, vec![0.5]);
        mem.insert_row(&t, &r, 0).unwrap();

        let (_, rref) = mem.table_data(0).unwrap().iter().next().unwrap();
        let decoded = RowData::decode(mem.row_bytes(rref)).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn test_duplicate_key_rolls_back_allocation() {
        let mut mem = mem_with_block(1);
        let t = table(0, 7, 1);

        assert!(mem.insert_row(&t, &row(5, vec![1.0]), 9).unwrap());
        let offset_after_first = mem.tail_remain();

        // Same (timestamp, seq) tuple: rejected, slab allocation undone.
        assert!(!mem.insert_row(&t, &row(5, vec![2.0]), 9).unwrap());
        assert_eq!(mem.tail_remain(), offset_after_first);
        assert_eq!(mem.num_rows(), 1);
        mem.assert_consistent();
    }

    #[test]
    fn test_stale_uid_discards_old_index() {
        let mut mem = mem_with_block(4);
        let old = table(1, 100, 1);
        for seq in 0..3 {
            mem.insert_row(&old, &row(seq as i64, vec![0.0]), seq).unwrap();
        }
        assert_eq!(mem.num_rows(), 3);

        // Same slot, new uid: the old index is dropped, not surfaced as an
        // error.
        let reused = table(1, 200, 1);
        mem.insert_row(&reused, &row(50, vec![9.0]), 10).unwrap();

        let tdata = mem.table_data(1).unwrap();
        assert_eq!(tdata.uid(), 200);
        assert_eq!(tdata.num_rows(), 1);
        assert_eq!(mem.num_rows(), 1);
        mem.assert_consistent();
    }

    #[test]
    fn test_unknown_schema_version_is_an_error() {
        let mut mem = mem_with_block(1);
        let t = table(0, 7, 1);
        let bad = RowData::new(1, 99, vec![1.0]);
        assert!(mem.insert_row(&t, &bad, 0).is_err());
        assert_eq!(mem.num_rows(), 0);
    }

    #[test]
    fn test_row_width_must_match_its_schema_version() {
        let mut mem = mem_with_block(1);
        let t = table(0, 7, 2);
        let narrow = RowData::new(1, 1, vec![1.0]);
        assert!(matches!(
            mem.insert_row(&t, &narrow, 0),
            Err(LodgeError::RowSchemaMismatch {
                version: 1,
                expected: 2,
                ncols: 1,
            })
        ));
        assert_eq!(mem.num_rows(), 0);
    }

    #[test]
    fn test_release_blocks_is_idempotent() {
        let mut mem = mem_with_block(1);
        let t = table(0, 7, 1);
        mem.insert_row(&t, &row(1, vec![1.0]), 0).unwrap();

        let blocks = mem.release_blocks();
        assert_eq!(blocks.len(), 1);
        assert!(mem.table_data(0).is_none());

        // Second teardown is a no-op, never a double release.
        assert!(mem.release_blocks().is_empty());
    }
}
