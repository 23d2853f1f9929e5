//! Repository: the write-path front door.
//!
//! A [`Repository`] owns the buffer pool, the active and immutable
//! generations and the background commit thread handle, all behind one
//! mutex. Writers take the lock per row; the slab append and index link are
//! cheap enough that a coarser lock beats fine-grained latching here. The
//! commit task only touches the shared state at its edges (cloning the
//! generation handle at start, retiring it at the end), so the lock is never
//! held across file I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::commit;
use crate::error::{LodgeError, Result};
use crate::mem::{BufPool, MemTable};
use crate::types::{Precision, RowData, Table, Timestamp};

/// Default number of buffer blocks in the pool.
pub const DEFAULT_TOTAL_BUF_BLOCKS: usize = 16;
/// Default size of one buffer block in bytes.
pub const DEFAULT_BUF_BLOCK_SIZE: usize = 1024 * 1024;
/// Default number of table slots.
pub const DEFAULT_MAX_TABLES: usize = 256;
/// Default hard cap on rows per on-disk block.
pub const DEFAULT_MAX_ROWS_PER_FILE_BLOCK: usize = 4096;
/// Default time span covered by one file group, in days.
pub const DEFAULT_DAYS_PER_FILE: u32 = 10;

/// Tuning knobs for a repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Number of buffer blocks in the pool. At least 2; a generation swaps
    /// out once it holds half of them.
    pub total_buf_blocks: usize,
    /// Size of one buffer block in bytes. Also the upper bound on one
    /// encoded row.
    pub buf_block_size: usize,
    /// Number of table slots addressable by table id.
    pub max_tables: usize,
    /// Hard cap on rows per on-disk block; the commit drain batches at 4/5
    /// of this.
    pub max_rows_per_file_block: usize,
    /// Time span covered by one file group, in days.
    pub days_per_file: u32,
    /// Timestamp precision of every key in the repository.
    pub precision: Precision,
    /// Retention horizon in file ids; `None` keeps everything.
    pub keep_fids: Option<u32>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            total_buf_blocks: DEFAULT_TOTAL_BUF_BLOCKS,
            buf_block_size: DEFAULT_BUF_BLOCK_SIZE,
            max_tables: DEFAULT_MAX_TABLES,
            max_rows_per_file_block: DEFAULT_MAX_ROWS_PER_FILE_BLOCK,
            days_per_file: DEFAULT_DAYS_PER_FILE,
            precision: Precision::Millis,
            keep_fids: None,
        }
    }
}

impl RepoConfig {
    /// Sets the number of buffer blocks in the pool.
    pub fn with_total_buf_blocks(mut self, total: usize) -> Self {
        self.total_buf_blocks = total;
        self
    }

    /// Sets the buffer block size in bytes.
    pub fn with_buf_block_size(mut self, size: usize) -> Self {
        self.buf_block_size = size;
        self
    }

    /// Sets the number of table slots.
    pub fn with_max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables = max_tables;
        self
    }

    /// Sets the hard cap on rows per on-disk block.
    pub fn with_max_rows_per_file_block(mut self, rows: usize) -> Self {
        self.max_rows_per_file_block = rows;
        self
    }

    /// Sets the time span covered by one file group, in days.
    pub fn with_days_per_file(mut self, days: u32) -> Self {
        self.days_per_file = days;
        self
    }

    /// Sets the timestamp precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Sets the retention horizon in file ids.
    pub fn with_keep_fids(mut self, keep_fids: u32) -> Self {
        self.keep_fids = Some(keep_fids);
        self
    }

    /// Timestamp ticks covered by one file group.
    pub fn ticks_per_file(&self) -> Timestamp {
        self.days_per_file as Timestamp * self.precision.ticks_per_day()
    }
}

/// Terminal outcome of one background commit, delivered to the status
/// callback from the commit thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    /// The generation was fully written to its file groups.
    CommitOver,
    /// The commit aborted; buffered rows of the failed generation are lost.
    CommitFailed,
}

/// Callback invoked from the commit thread on commit completion.
pub type StatusCallback = Box<dyn Fn(RepoStatus) + Send + Sync>;

pub(crate) struct RepoState {
    pub(crate) pool: BufPool,
    pub(crate) mem: Option<MemTable>,
    pub(crate) imem: Option<Arc<MemTable>>,
    /// True from generation swap until the commit task has returned every
    /// block to the pool. Outlives the `imem` slot by the retirement window.
    pub(crate) committing: bool,
    pub(crate) commit_handle: Option<JoinHandle<()>>,
}

pub(crate) struct RepoInner {
    pub(crate) config: RepoConfig,
    pub(crate) dir: PathBuf,
    pub(crate) state: Mutex<RepoState>,
    pub(crate) pool_not_empty: Condvar,
    seq: AtomicU64,
    status: Option<StatusCallback>,
}

impl RepoInner {
    pub(crate) fn notify(&self, status: RepoStatus) {
        if let Some(callback) = &self.status {
            callback(status);
        }
    }
}

/// Point-in-time snapshot of buffer ownership and commit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoStats {
    /// Rows buffered in the active generation.
    pub mem_rows: u64,
    /// Blocks held by the active generation.
    pub mem_blocks: usize,
    /// Blocks held by the immutable generation.
    pub imem_blocks: usize,
    /// Blocks idle in the pool.
    pub pool_free: usize,
    /// True while a commit is outstanding.
    pub committing: bool,
}

enum Capacity {
    /// The tail block fits the row; insert under the held guard.
    Ready,
    /// A swap is blocked on the previous commit; release the lock and join.
    JoinCommit,
}

/// Time-series write buffer committing to day-partitioned file groups.
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    /// Opens (creating if needed) a repository rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: RepoConfig) -> Result<Self> {
        Self::open_inner(dir.as_ref(), config, None)
    }

    /// Like [`open`](Self::open), with a callback invoked from the commit
    /// thread when each commit finishes.
    pub fn open_with_status(
        dir: impl AsRef<Path>,
        config: RepoConfig,
        status: StatusCallback,
    ) -> Result<Self> {
        Self::open_inner(dir.as_ref(), config, Some(status))
    }

    fn open_inner(dir: &Path, config: RepoConfig, status: Option<StatusCallback>) -> Result<Self> {
        assert!(config.buf_block_size > 0, "buffer blocks must be non-empty");
        assert!(config.max_tables > 0, "at least one table slot required");
        assert!(
            config.max_rows_per_file_block >= 8,
            "file blocks must hold a useful number of rows"
        );
        std::fs::create_dir_all(dir)?;

        let pool = BufPool::new(config.total_buf_blocks, config.buf_block_size);
        debug!(
            dir = %dir.display(),
            total_buf_blocks = config.total_buf_blocks,
            buf_block_size = config.buf_block_size,
            "repository opened"
        );
        Ok(Self {
            inner: Arc::new(RepoInner {
                config,
                dir: dir.to_path_buf(),
                state: Mutex::new(RepoState {
                    pool,
                    mem: None,
                    imem: None,
                    committing: false,
                    commit_handle: None,
                }),
                pool_not_empty: Condvar::new(),
                seq: AtomicU64::new(0),
                status,
            }),
        })
    }

    /// Configuration this repository was opened with.
    pub fn config(&self) -> &RepoConfig {
        &self.inner.config
    }

    /// Buffers one row for `table`.
    ///
    /// Returns true if the row was newly buffered, false if a row with the
    /// same timestamp was already buffered for this table in the same
    /// instant (exact tuple-key duplicate). May block while the pool is
    /// exhausted and the outstanding commit has not yet returned its blocks.
    pub fn insert_row(&self, table: &Arc<Table>, row: &RowData) -> Result<bool> {
        let tid = table.tid();
        if tid >= self.inner.config.max_tables {
            return Err(LodgeError::TableSlotOutOfRange {
                tid,
                max_tables: self.inner.config.max_tables,
            });
        }
        let bytes = row.encoded_len();
        if bytes > self.inner.config.buf_block_size {
            return Err(LodgeError::RowTooLarge {
                bytes,
                block_size: self.inner.config.buf_block_size,
            });
        }

        loop {
            let mut state = self.inner.state.lock();
            match Self::ensure_capacity(&self.inner, &mut state, bytes)? {
                Capacity::Ready => {
                    let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                    let mem = state.mem.as_mut().expect("capacity check left a tail block");
                    return mem.insert_row(table, row, seq);
                }
                Capacity::JoinCommit => {
                    drop(state);
                    self.join_commit()?;
                }
            }
        }
    }

    /// Ensures the active generation has a tail block with at least `bytes`
    /// free, swapping or borrowing from the pool as needed.
    fn ensure_capacity<'a>(
        inner: &Arc<RepoInner>,
        state: &mut MutexGuard<'a, RepoState>,
        bytes: usize,
    ) -> Result<Capacity> {
        let half_budget = inner.config.total_buf_blocks / 2;

        if state.mem.as_ref().is_some_and(|m| m.tail_remain() < bytes) {
            let blocks = state.mem.as_ref().map_or(0, |m| m.num_blocks());
            if blocks >= half_budget {
                // Swap rather than grow past half the budget, so the next
                // generation can fill while this one commits.
                if state.imem.is_some() || state.committing {
                    return Ok(Capacity::JoinCommit);
                }
                Self::swap_and_spawn(inner, state)?;
            } else {
                let block = Self::acquire_block(inner, state)?;
                state
                    .mem
                    .as_mut()
                    .expect("grow path requires an active generation")
                    .push_block(block);
            }
        }

        if state.mem.is_none() {
            let block = Self::acquire_block(inner, state)?;
            let mut mem = MemTable::new(inner.config.max_tables);
            mem.push_block(block);
            state.mem = Some(mem);
        }
        Ok(Capacity::Ready)
    }

    /// Takes a block from the pool, waiting on the commit task to return
    /// blocks while the pool is empty.
    ///
    /// The wait is only entered while a commit is outstanding; an empty pool
    /// with no commit in flight cannot refill itself and is surfaced as
    /// exhaustion.
    fn acquire_block<'a>(
        inner: &Arc<RepoInner>,
        state: &mut MutexGuard<'a, RepoState>,
    ) -> Result<crate::mem::BufBlock> {
        loop {
            if let Some(block) = state.pool.try_acquire() {
                return Ok(block);
            }
            if state.imem.is_none() && !state.committing {
                return Err(LodgeError::BufferExhausted);
            }
            inner.pool_not_empty.wait(state);
        }
    }

    /// Moves the active generation to the immutable slot and spawns the
    /// commit thread for it.
    ///
    /// On spawn failure the generation stays in the immutable slot with its
    /// rows intact; a later [`join_commit`](Self::join_commit) retries the
    /// spawn.
    fn swap_and_spawn<'a>(
        inner: &Arc<RepoInner>,
        state: &mut MutexGuard<'a, RepoState>,
    ) -> Result<()> {
        assert!(state.imem.is_none(), "swap over an unretired generation");
        assert!(!state.committing, "swap while a commit is outstanding");

        let mem = state.mem.take().expect("swap without an active generation");
        debug!(
            num_rows = mem.num_rows(),
            num_blocks = mem.num_blocks(),
            "generation swap, scheduling commit"
        );
        state.imem = Some(Arc::new(mem));
        Self::spawn_commit(inner, state)
    }

    /// Marks the immutable generation as committing and spawns its thread.
    fn spawn_commit<'a>(
        inner: &Arc<RepoInner>,
        state: &mut MutexGuard<'a, RepoState>,
    ) -> Result<()> {
        state.committing = true;
        let task_inner = Arc::clone(inner);
        match thread::Builder::new()
            .name("lodge-commit".into())
            .spawn(move || commit::commit_task(task_inner))
        {
            Ok(handle) => {
                state.commit_handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                state.committing = false;
                error!(%err, "commit thread spawn failed, generation retained for retry");
                Err(LodgeError::CommitSpawn(err))
            }
        }
    }

    /// Waits for the outstanding commit (if any) to finish, retrying a
    /// previously failed spawn first.
    fn join_commit(&self) -> Result<()> {
        loop {
            let handle = {
                let mut state = self.inner.state.lock();
                match state.commit_handle.take() {
                    Some(handle) => Some(handle),
                    None if state.imem.is_some() && !state.committing => {
                        // A spawn failed earlier; the generation is still
                        // waiting for its commit.
                        Self::spawn_commit(&self.inner, &mut state)?;
                        continue;
                    }
                    None => None,
                }
            };
            let Some(handle) = handle else {
                return Ok(());
            };
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
            return Ok(());
        }
    }

    /// Commits everything currently buffered and waits for it to reach disk.
    pub fn flush(&self) -> Result<()> {
        loop {
            let mut state = self.inner.state.lock();
            if state.imem.is_some() || state.committing {
                drop(state);
                self.join_commit()?;
                continue;
            }
            let Some(mem) = state.mem.as_ref() else {
                return Ok(());
            };
            if mem.num_rows() == 0 {
                return Ok(());
            }
            Self::swap_and_spawn(&self.inner, &mut state)?;
            drop(state);
            return self.join_commit();
        }
    }

    /// Snapshot of buffer ownership and commit state.
    pub fn stats(&self) -> RepoStats {
        let state = self.inner.state.lock();
        RepoStats {
            mem_rows: state.mem.as_ref().map_or(0, |m| m.num_rows()),
            mem_blocks: state.mem.as_ref().map_or(0, |m| m.num_blocks()),
            imem_blocks: state.imem.as_ref().map_or(0, |m| m.num_blocks()),
            pool_free: state.pool.free_count(),
            committing: state.committing,
        }
    }

    /// Flushes buffered rows and waits for the commit thread to exit.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        // Best-effort join so a detached commit never outlives the caller's
        // view of the repository. Errors and panics are already reported by
        // the commit thread itself.
        let handle = self.inner.state.lock().commit_handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders_and_ticks() {
        let cfg = RepoConfig::default()
            .with_days_per_file(2)
            .with_precision(Precision::Millis)
            .with_keep_fids(30);
        assert_eq!(cfg.ticks_per_file(), 2 * 86_400_000);
        assert_eq!(cfg.keep_fids, Some(30));
        assert_eq!(cfg.total_buf_blocks, DEFAULT_TOTAL_BUF_BLOCKS);
    }

    #[test]
    fn test_stats_on_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path(), RepoConfig::default().with_total_buf_blocks(4))
            .unwrap();
        let stats = repo.stats();
        assert_eq!(stats.pool_free, 4);
        assert_eq!(stats.mem_rows, 0);
        assert!(!stats.committing);
    }
}
