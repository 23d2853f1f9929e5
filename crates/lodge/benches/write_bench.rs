use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use lodge::{RepoConfig, Repository, RowData, Schema, Table};

fn bench_config() -> RepoConfig {
    RepoConfig::default()
        .with_total_buf_blocks(16)
        .with_buf_block_size(1024 * 1024)
        .with_max_tables(64)
}

fn insert_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_rows");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("single_table_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let repo = Repository::open(dir.path(), bench_config()).unwrap();
                (dir, repo)
            },
            |(_dir, repo)| {
                let table = Arc::new(Table::new(0, 1, Schema::new(1, 4)));
                for ts in 0..10_000i64 {
                    repo.insert_row(&table, &RowData::new(ts, 1, vec![1.0, 2.0, 3.0, 4.0]))
                        .unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("spread_64_tables_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let repo = Repository::open(dir.path(), bench_config()).unwrap();
                let tables: Vec<Arc<Table>> = (0..64)
                    .map(|tid| Arc::new(Table::new(tid, tid as u64 + 1, Schema::new(1, 4))))
                    .collect();
                (dir, repo, tables)
            },
            |(_dir, repo, tables)| {
                for ts in 0..10_000i64 {
                    let table = &tables[(ts % 64) as usize];
                    repo.insert_row(table, &RowData::new(ts, 1, vec![1.0, 2.0, 3.0, 4.0]))
                        .unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn flush_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush_generation");
    group.sample_size(20);

    group.bench_function("flush_10k_rows", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let repo = Repository::open(dir.path(), bench_config()).unwrap();
                let table = Arc::new(Table::new(0, 1, Schema::new(1, 4)));
                for ts in 0..10_000i64 {
                    repo.insert_row(&table, &RowData::new(ts, 1, vec![1.0, 2.0, 3.0, 4.0]))
                        .unwrap();
                }
                (dir, repo)
            },
            |(_dir, repo)| repo.flush().unwrap(),
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(benches, insert_rows, flush_generation);
criterion_main!(benches);
