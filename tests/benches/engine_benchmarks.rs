//! # RM Engine Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | RangeString | add, contains, display, parse, difference |
//! | Bean store | key lookup, query-by-example, transaction cycle |

use criterion::{criterion_group, criterion_main};
use rm_tests::benchmarks::{bean_store, range_string};

criterion_group!(
    benches,
    range_string::bench_range_string,
    bean_store::bench_bean_store,
);

criterion_main!(benches);
