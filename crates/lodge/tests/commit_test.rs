//! Commit-pipeline integration tests: day partitioning, re-commit into
//! existing groups, retention and status reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lodge::fgroup::fgroup_exists;
use lodge::{
    FileGroupReader, RepoConfig, RepoStatus, Repository, RowData, Schema, Table,
};

const DAY_MS: i64 = 86_400_000;

fn small_config() -> RepoConfig {
    RepoConfig::default()
        .with_total_buf_blocks(4)
        .with_buf_block_size(256)
        .with_max_tables(8)
        .with_max_rows_per_file_block(64)
        .with_days_per_file(1)
}

fn table(tid: usize, uid: u64, ncols: u16) -> Arc<Table> {
    Arc::new(Table::new(tid, uid, Schema::new(1, ncols)))
}

#[test]
fn test_commit_round_trip_across_tables() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();

    let t0 = table(0, 1, 2);
    let t1 = table(3, 2, 1);
    for ts in 0..10i64 {
        repo.insert_row(&t0, &RowData::new(ts, 1, vec![ts as f64, -(ts as f64)]))
            .unwrap();
        repo.insert_row(&t1, &RowData::new(ts, 1, vec![100.0 + ts as f64]))
            .unwrap();
    }
    repo.flush().unwrap();

    let reader = FileGroupReader::open(dir.path(), 0).unwrap();

    let rows0 = reader.read_rows(0).unwrap();
    assert_eq!(rows0.len(), 10);
    assert_eq!(rows0[7].ts, 7);
    assert_eq!(rows0[7].values, vec![7.0, -7.0]);

    let rows1 = reader.read_rows(3).unwrap();
    assert_eq!(rows1.len(), 10);
    assert_eq!(rows1[9].values, vec![109.0]);

    // Untouched table slots commit nothing.
    assert!(reader.read_rows(5).unwrap().is_empty());
}

#[test]
fn test_commit_splits_one_generation_across_days() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();
    let t = table(0, 1, 1);

    for ts in [5i64, 10, DAY_MS + 5, DAY_MS + 10] {
        repo.insert_row(&t, &RowData::new(ts, 1, vec![ts as f64])).unwrap();
    }
    repo.flush().unwrap();

    let day0 = FileGroupReader::open(dir.path(), 0).unwrap().read_rows(0).unwrap();
    assert_eq!(day0.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![5, 10]);

    let day1 = FileGroupReader::open(dir.path(), 1).unwrap().read_rows(0).unwrap();
    assert_eq!(
        day1.iter().map(|r| r.ts).collect::<Vec<_>>(),
        vec![DAY_MS + 5, DAY_MS + 10]
    );
}

#[test]
fn test_empty_day_in_the_key_range_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();
    let t = table(0, 1, 1);

    // Data on day 0 and day 2 only; the commit scans fid 1 and must skip it
    // without creating files.
    repo.insert_row(&t, &RowData::new(10, 1, vec![1.0])).unwrap();
    repo.insert_row(&t, &RowData::new(2 * DAY_MS + 10, 1, vec![2.0]))
        .unwrap();
    repo.flush().unwrap();

    assert!(fgroup_exists(dir.path(), 0));
    assert!(!fgroup_exists(dir.path(), 1));
    assert!(fgroup_exists(dir.path(), 2));
    assert!(!dir.path().join("f1.data").exists());
}

#[test]
fn test_recommit_appends_to_an_existing_group() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();
    let t = table(0, 1, 1);

    for ts in 0..10i64 {
        repo.insert_row(&t, &RowData::new(ts, 1, vec![0.0])).unwrap();
    }
    repo.flush().unwrap();

    for ts in 10..20i64 {
        repo.insert_row(&t, &RowData::new(ts, 1, vec![1.0])).unwrap();
    }
    repo.flush().unwrap();

    let reader = FileGroupReader::open(dir.path(), 0).unwrap();
    assert!(reader.blocks().len() >= 2);
    let rows = reader.read_rows(0).unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[19].ts, 19);
    assert_eq!(rows[19].values, vec![1.0]);
}

#[test]
fn test_recommit_with_older_timestamps_reads_back_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();
    let t = table(0, 1, 1);

    for ts in 100..105i64 {
        repo.insert_row(&t, &RowData::new(ts, 1, vec![ts as f64])).unwrap();
    }
    repo.flush().unwrap();

    // A later commit carries earlier timestamps into the same day.
    for ts in 0..5i64 {
        repo.insert_row(&t, &RowData::new(ts, 1, vec![ts as f64])).unwrap();
    }
    repo.flush().unwrap();

    let rows = FileGroupReader::open(dir.path(), 0)
        .unwrap()
        .read_rows(0)
        .unwrap();
    let timestamps: Vec<i64> = rows.iter().map(|r| r.ts).collect();
    assert_eq!(timestamps, vec![0, 1, 2, 3, 4, 100, 101, 102, 103, 104]);
    assert_eq!(rows[0].values, vec![0.0]);
    assert_eq!(rows[9].values, vec![104.0]);
}

#[test]
fn test_retention_runs_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config().with_keep_fids(1)).unwrap();
    let t = table(0, 1, 1);

    repo.insert_row(&t, &RowData::new(10, 1, vec![1.0])).unwrap();
    repo.flush().unwrap();
    assert!(fgroup_exists(dir.path(), 0));

    // Committing day 5 moves the horizon past day 0.
    repo.insert_row(&t, &RowData::new(5 * DAY_MS + 10, 1, vec![2.0]))
        .unwrap();
    repo.flush().unwrap();

    assert!(!fgroup_exists(dir.path(), 0));
    assert!(fgroup_exists(dir.path(), 5));
}

#[test]
fn test_status_callback_reports_commit_over() {
    let dir = tempfile::tempdir().unwrap();
    let overs = Arc::new(AtomicUsize::new(0));
    let fails = Arc::new(AtomicUsize::new(0));
    let (o, f) = (Arc::clone(&overs), Arc::clone(&fails));

    let repo = Repository::open_with_status(
        dir.path(),
        small_config(),
        Box::new(move |status| match status {
            RepoStatus::CommitOver => {
                o.fetch_add(1, Ordering::SeqCst);
            }
            RepoStatus::CommitFailed => {
                f.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .unwrap();

    let t = table(0, 1, 1);
    repo.insert_row(&t, &RowData::new(1, 1, vec![1.0])).unwrap();
    repo.flush().unwrap();
    repo.insert_row(&t, &RowData::new(2, 1, vec![2.0])).unwrap();
    repo.flush().unwrap();

    assert_eq!(overs.load(Ordering::SeqCst), 2);
    assert_eq!(fails.load(Ordering::SeqCst), 0);
}

#[test]
fn test_schema_evolution_pads_old_rows_in_committed_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path(), small_config()).unwrap();

    let mut t = Table::new(0, 1, Schema::new(1, 1));
    t.add_schema(Schema::new(2, 2));
    let t = Arc::new(t);

    // One row under each schema version; the block is written under the
    // current (wider) schema with the old row NaN-padded.
    repo.insert_row(&t, &RowData::new(1, 1, vec![1.0])).unwrap();
    repo.insert_row(&t, &RowData::new(2, 2, vec![2.0, 2.5])).unwrap();
    repo.flush().unwrap();

    let rows = FileGroupReader::open(dir.path(), 0)
        .unwrap()
        .read_rows(0)
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values[0], 1.0);
    assert!(rows[0].values[1].is_nan());
    assert_eq!(rows[1].values, vec![2.0, 2.5]);
}
