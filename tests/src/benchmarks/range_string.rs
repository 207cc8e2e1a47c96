//! # RangeString Benchmarks
//!
//! Acknowledgement sets are rebuilt, merged and printed on every inbound
//! message, so these operations sit on the hot path.
//!
//! Conditions:
//! - Dense sets (one range) and sparse sets (every other number)
//! - Numbers added in random order
//! - Sets of up to 10k numbers

use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::Rng;
use rm_engine::RangeString;
use std::time::Duration;

fn sparse(size: u64) -> RangeString {
    let mut set = RangeString::new();
    for n in (1..=size * 2).step_by(2) {
        set.add(n);
    }
    set
}

pub fn bench_range_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("rm/range_string");
    group.measurement_time(Duration::from_secs(5));

    for size in [100u64, 1_000, 10_000] {
        let mut shuffled: Vec<u64> = (1..=size).collect();
        shuffled.shuffle(&mut rand::thread_rng());

        group.throughput(Throughput::Elements(size));
        group.bench_with_input(
            BenchmarkId::new("add_shuffled", size),
            &shuffled,
            |b, numbers| {
                b.iter(|| {
                    let mut set = RangeString::new();
                    for &n in numbers {
                        set.add(n);
                    }
                    black_box(set)
                })
            },
        );

        let sparse_set = sparse(size);
        let mut rng = rand::thread_rng();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("contains_sparse", size),
            &sparse_set,
            |b, set| b.iter(|| black_box(set.contains(rng.gen_range(1..=size * 2)))),
        );

        group.bench_with_input(
            BenchmarkId::new("display_sparse", size),
            &sparse_set,
            |b, set| b.iter(|| black_box(set.to_string())),
        );

        let text = sparse_set.to_string();
        group.bench_with_input(BenchmarkId::new("parse_sparse", size), &text, |b, text| {
            b.iter(|| black_box(text.parse::<RangeString>().ok()))
        });

        let acked = RangeString::from_range(1, size);
        group.bench_with_input(
            BenchmarkId::new("difference", size),
            &(acked, sparse_set),
            |b, (acked, completed)| b.iter(|| black_box(acked.difference(completed))),
        );
    }

    group.finish();
}
