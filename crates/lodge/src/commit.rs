//! Background commit pipeline: drains one immutable generation into
//! day-partitioned file groups, then retires it.
//!
//! One commit task runs at a time; the repository joins the previous task
//! before swapping again. The task owns the immutable generation exclusively
//! for reading, so the drain needs no coordination with writers. Whatever
//! happens mid-commit, retirement always runs: the generation's blocks go
//! back to the pool and the commit-in-progress flag clears, so a failed
//! commit can never wedge writers forever.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::Result;
use crate::fgroup::{self, FileGroupWriter};
use crate::mem::skiplist::SkipListIter;
use crate::mem::{MemTable, TableData};
use crate::repo::{RepoInner, RepoStatus};
use crate::types::{RowData, Schema, Timestamp};

/// Reusable row-batch buffer converting ordered rows into one columnar block.
///
/// Allocated once per commit, sized to the worst-case schema width across all
/// tables in the generation, and re-initialized per table with that table's
/// current schema. Rows written under an older, narrower schema version are
/// padded with NaN in the missing columns.
#[derive(Debug)]
pub struct DataCols {
    ncols: u16,
    schema_version: u32,
    ts: Vec<Timestamp>,
    cols: Vec<Vec<f64>>,
}

impl DataCols {
    /// Creates a buffer able to hold `max_rows` rows of up to `max_cols`
    /// value columns without reallocating.
    pub fn new(max_cols: u16, max_rows: usize) -> Self {
        let cols = (0..max_cols)
            .map(|_| Vec::with_capacity(max_rows))
            .collect();
        Self {
            ncols: 0,
            schema_version: 0,
            ts: Vec::with_capacity(max_rows),
            cols,
        }
    }

    /// Re-initializes the buffer for one table's current schema.
    pub fn reset_for(&mut self, schema: &Schema) {
        self.ncols = schema.ncols();
        self.schema_version = schema.version();
        while self.cols.len() < self.ncols as usize {
            self.cols.push(Vec::new());
        }
        self.clear();
    }

    /// Drops buffered rows, keeping the schema setup.
    pub fn clear(&mut self) {
        self.ts.clear();
        for col in &mut self.cols {
            col.clear();
        }
    }

    /// Appends one row, padding columns the row's schema version lacked.
    pub fn push_row(&mut self, row: &RowData) {
        self.ts.push(row.ts);
        for c in 0..self.ncols as usize {
            self.cols[c].push(row.values.get(c).copied().unwrap_or(f64::NAN));
        }
    }

    /// Rows currently buffered.
    pub fn num_rows(&self) -> usize {
        self.ts.len()
    }

    /// Value-column count of the current table.
    pub fn ncols(&self) -> u16 {
        self.ncols
    }

    /// Schema version the block is written under.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Timestamp column.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.ts
    }

    /// One value column.
    pub fn column(&self, c: usize) -> &[f64] {
        &self.cols[c]
    }

    /// Timestamp of the first buffered row.
    pub fn key_first(&self) -> Timestamp {
        self.ts[0]
    }

    /// Timestamp of the last buffered row (rows arrive key-ordered).
    pub fn key_last(&self) -> Timestamp {
        *self.ts.last().expect("non-empty batch")
    }
}

/// Commit thread entry point.
pub(crate) fn commit_task(inner: Arc<RepoInner>) {
    let imem = {
        let state = inner.state.lock();
        assert!(state.committing, "commit task without commit flag");
        Arc::clone(
            state
                .imem
                .as_ref()
                .expect("commit task without immutable generation"),
        )
    };

    debug!(
        key_first = imem.key_first(),
        key_last = imem.key_last(),
        num_rows = imem.num_rows(),
        "commit started"
    );

    match commit_data(&inner, &imem) {
        Ok(()) => {
            debug!(num_rows = imem.num_rows(), "commit over");
            inner.notify(RepoStatus::CommitOver);
        }
        Err(err) => {
            // Durability-impacting: surfaced through the status channel, the
            // generation is still retired below so writers cannot deadlock.
            error!(%err, "commit failed, aborting remaining file ids");
            inner.notify(RepoStatus::CommitFailed);
        }
    }

    retire(&inner, imem);
}

fn commit_data(inner: &Arc<RepoInner>, imem: &MemTable) -> Result<()> {
    if imem.num_rows() == 0 {
        return Ok(());
    }
    let cfg = &inner.config;

    let mut iters: Vec<Option<SkipListIter<'_>>> = (0..cfg.max_tables)
        .map(|tid| {
            imem.table_data(tid)
                .filter(|t| t.num_rows() > 0)
                .map(|t| t.iter())
        })
        .collect();

    let mut cols = DataCols::new(imem.max_cols(), cfg.max_rows_per_file_block);

    let ticks = cfg.ticks_per_file();
    let first_fid = fgroup::fid_of_key(imem.key_first(), ticks);
    let last_fid = fgroup::fid_of_key(imem.key_last(), ticks);

    for fid in first_fid..=last_fid {
        commit_to_file(inner, imem, fid, &mut iters, &mut cols)?;
    }

    if let Some(keep_fids) = cfg.keep_fids {
        fgroup::apply_retention(&inner.dir, last_fid, keep_fids)?;
    }
    Ok(())
}

fn commit_to_file(
    inner: &Arc<RepoInner>,
    imem: &MemTable,
    fid: i64,
    iters: &mut [Option<SkipListIter<'_>>],
    cols: &mut DataCols,
) -> Result<()> {
    let cfg = &inner.config;
    let (min_key, max_key) = fgroup::key_range_of_fid(fid, cfg.ticks_per_file());

    // Cheap pre-scan: skip the file id entirely when no table has a row in
    // its interval.
    let has_data = iters.iter().any(|iter| {
        iter.as_ref()
            .and_then(|i| i.peek())
            .is_some_and(|(key, _)| key.ts <= max_key)
    });
    if !has_data {
        return Ok(());
    }

    let mut writer = FileGroupWriter::open_or_create(&inner.dir, fid, cfg.max_rows_per_file_block)?;

    for tid in 0..iters.len() {
        let Some(iter) = iters[tid].as_mut() else {
            continue;
        };
        let tdata = imem.table_data(tid).expect("iterator implies table data");
        cols.reset_for(tdata.table().schema());

        // Drain target below the hard block cap, per the write amplification
        // heuristic of the block writer.
        let batch_rows = cfg.max_rows_per_file_block * 4 / 5;
        loop {
            read_rows(imem, tdata, iter, max_key, batch_rows, cols)?;
            if cols.num_rows() == 0 {
                break;
            }
            debug_assert!(cols.key_first() >= min_key);
            debug_assert!(cols.key_last() <= max_key);

            let written = writer.append_block(tid as u32, cols)?;
            assert!(written > 0, "file block write consumed no rows");
            cols.clear();
        }
    }

    writer.finalize()
}

/// Reads up to `max_rows` rows with keys at or below `max_key` into `cols`,
/// advancing the table cursor past each row consumed.
fn read_rows(
    imem: &MemTable,
    tdata: &TableData,
    iter: &mut SkipListIter<'_>,
    max_key: Timestamp,
    max_rows: usize,
    cols: &mut DataCols,
) -> Result<usize> {
    let mut num_rows = 0;
    let mut seen_version: Option<u32> = None;

    while num_rows < max_rows {
        let Some((key, rref)) = iter.peek() else {
            break;
        };
        if key.ts > max_key {
            break;
        }
        let row = RowData::decode(imem.row_bytes(rref))?;
        if seen_version != Some(row.schema_version) {
            // Every version written must still resolve against the table.
            tdata.table().schema_by_version(row.schema_version)?;
            seen_version = Some(row.schema_version);
        }
        cols.push_row(&row);
        iter.advance();
        num_rows += 1;
    }
    Ok(num_rows)
}

/// Retires the committed generation: clears the immutable slot, returns the
/// blocks to the pool, wakes waiting writers and drops the commit flag.
fn retire(inner: &Arc<RepoInner>, imem: Arc<MemTable>) {
    {
        let mut state = inner.state.lock();
        let slot = state.imem.take();
        assert!(slot.is_some(), "retire without immutable generation");
    }

    // The slot reference is gone; ours is the last.
    match Arc::try_unwrap(imem) {
        Ok(mut mem) => {
            mem.assert_consistent();
            let blocks = mem.release_blocks();
            let mut state = inner.state.lock();
            for block in blocks {
                state.pool.release(block);
            }
            state.committing = false;
            inner.pool_not_empty.notify_all();
        }
        Err(_) => {
            // A leaked reference would let buffer blocks escape the pool.
            panic!("immutable generation still referenced at retirement");
        }
    }
}
