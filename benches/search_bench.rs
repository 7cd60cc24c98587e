// Search performance benchmarks for mergeset

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mergeset::{Options, Table};
use rand::Rng;
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

fn populate(size: usize) -> (TempDir, Table) {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::open(
        temp_dir.path(),
        Options::new().flush_interval(Duration::from_secs(3600)).final_merge_delay(Duration::ZERO),
    )
    .unwrap();
    let items: Vec<String> = (0..size).map(|i| format!("key{:08}", i)).collect();
    for chunk in items.chunks(10000) {
        table.add_items(chunk).unwrap();
        table.debug_flush().unwrap();
    }
    (temp_dir, table)
}

fn benchmark_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_scan");

    for size in [10000, 100000].iter() {
        let (_dir, table) = populate(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut ts = table.search();
                ts.seek(b"").unwrap();
                let mut n = 0;
                while ts.next_item().unwrap() {
                    n += 1;
                }
                black_box(n);
            });
        });
    }

    group.finish();
}

fn benchmark_random_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_seek");

    for size in [10000, 100000].iter() {
        let (_dir, table) = populate(*size);
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = rand::rng();
            b.iter(|| {
                let mut ts = table.search();
                for _ in 0..1000 {
                    let key = format!("key{:08}", rng.random_range(0..size));
                    black_box(ts.first_item_with_prefix(key.as_bytes()).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_increasing_seek(c: &mut Criterion) {
    let (_dir, table) = populate(100000);
    c.bench_function("increasing_seek", |b| {
        b.iter(|| {
            let mut ts = table.search();
            for i in (0..100000).step_by(100) {
                let key = format!("key{:08}", i);
                ts.seek(key.as_bytes()).unwrap();
                black_box(ts.next_item().unwrap());
            }
        });
    });
}

criterion_group!(benches, benchmark_scan, benchmark_random_seek, benchmark_increasing_seek);
criterion_main!(benches);
