//! Bulk construction and range-scan benchmarks over a 4KB-block index.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qalsh_index::{BTree, Entry, ScanDirection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const BLOCK_LENGTH: usize = 4096;
const TABLE_SIZE: usize = 100_000;

fn sorted_table(n: usize) -> Vec<Entry> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut table: Vec<Entry> = (0..n)
        .map(|i| Entry::new(rng.gen_range(-100.0..100.0), i as u32))
        .collect();
    table.sort_by(|a, b| a.key.partial_cmp(&b.key).unwrap());
    table
}

fn bench_bulk_construct(c: &mut Criterion) {
    let table = sorted_table(TABLE_SIZE);

    c.bench_function("bulk_construct_100k", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("bench.idx");
            let tree = BTree::create(BLOCK_LENGTH, path).unwrap();
            black_box(tree.bulk_construct(&table).unwrap());
        });
    });
}

fn bench_locate_and_scan(c: &mut Criterion) {
    let table = sorted_table(TABLE_SIZE);
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bench.idx");
    {
        let tree = BTree::create(BLOCK_LENGTH, &path).unwrap();
        tree.bulk_construct(&table).unwrap();
    }
    let tree = BTree::restore(&path).unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    c.bench_function("locate", |b| {
        b.iter(|| {
            let key = rng.gen_range(-100.0..100.0);
            black_box(tree.locate(black_box(key), ScanDirection::Ascending).unwrap());
        });
    });

    c.bench_function("scan_256_entries", |b| {
        b.iter(|| {
            let pos = tree.locate(0.0, ScanDirection::Ascending).unwrap().unwrap();
            let sum: u64 = tree
                .scan(pos, ScanDirection::Ascending)
                .take(256)
                .map(|e| e.unwrap().id as u64)
                .sum();
            black_box(sum);
        });
    });
}

criterion_group!(benches, bench_bulk_construct, bench_locate_and_scan);
criterion_main!(benches);
