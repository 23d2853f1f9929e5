//! Lodge: a time-series write buffer with background commit.
//!
//! Rows stream into an in-memory generation built from pooled buffer blocks
//! (a slab allocator plus one skip-list index per table). When a generation
//! has consumed half of the block budget it is swapped out and a background
//! thread commits it to day-partitioned file groups on disk, while writers
//! keep filling the next generation. Each file group is a head/data/last
//! triplet: a block directory, full-size columnar blocks and an overflow
//! file for fragments.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lodge::{Repository, RepoConfig, RowData, Schema, Table};
//!
//! # fn main() -> lodge::Result<()> {
//! let repo = Repository::open("/var/lib/lodge", RepoConfig::default())?;
//! let table = Arc::new(Table::new(0, 1001, Schema::new(1, 2)));
//!
//! repo.insert_row(&table, &RowData::new(1_700_000_000_000, 1, vec![21.5, 0.4]))?;
//! repo.flush()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod commit;
pub mod error;
pub mod fgroup;
pub mod mem;
pub mod repo;
pub mod types;

pub use error::{LodgeError, Result};
pub use fgroup::FileGroupReader;
pub use repo::{RepoConfig, RepoStats, RepoStatus, Repository, StatusCallback};
pub use types::{Precision, RowData, RowKey, Schema, Table, Timestamp};
