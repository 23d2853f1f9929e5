//! In-memory write buffer: block pool, slab-backed row storage and the
//! per-table ordered indexes that make up one generation.

pub mod memtable;
pub mod pool;
pub mod skiplist;

pub use memtable::{MemTable, TableData};
pub use pool::{BufBlock, BufPool};
pub use skiplist::{RowRef, SkipList, SkipListIter, SKIPLIST_MAX_LEVEL};
