//! # Bean Store Benchmarks
//!
//! Lookups the Sender performs on every pass:
//! - key lookup of a pending-send record
//! - query-by-example over all pending-send records of one sequence
//! - a lock/read/commit transaction cycle
//!
//! Conditions: 1k to 50k pending records spread over 10 sequences.

use criterion::{black_box, BenchmarkId, Criterion};
use rand::Rng;
use rm_engine::domain::{MessageType, RmVersion, RmsBean, RmsQuery, SenderBean, SenderQuery};
use rm_engine::StorageManager;
use std::time::Duration;

const SEQUENCES: usize = 10;

fn populate(records: usize) -> StorageManager {
    let store = StorageManager::new();
    let mut tx = store.begin().expect("begin");
    for s in 0..SEQUENCES {
        let mut rms = RmsBean::new(
            format!("int-{}", s),
            format!("cs-{}", s),
            RmVersion::V1_1,
            0,
        );
        rms.sequence_id = Some(format!("seq-{}", s));
        tx.insert(rms).expect("insert RMS");
    }
    for i in 0..records {
        let mut bean = SenderBean::new(
            format!("msg-{}", i),
            format!("key-{}", i),
            MessageType::Application,
        );
        bean.internal_sequence_id = Some(format!("int-{}", i % SEQUENCES));
        bean.message_number = (i / SEQUENCES + 1) as u64;
        bean.time_to_send = i as i64;
        tx.insert(bean).expect("insert pending-send record");
    }
    tx.commit().expect("commit");
    store
}

pub fn bench_bean_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("rm/bean_store");
    group.measurement_time(Duration::from_secs(5));

    for records in [1_000usize, 10_000, 50_000] {
        let store = populate(records);
        let mut rng = rand::thread_rng();

        group.bench_with_input(BenchmarkId::new("peek_by_key", records), &store, |b, s| {
            b.iter(|| {
                let key = format!("msg-{}", rng.gen_range(0..records));
                black_box(s.peek::<SenderBean>(&key))
            })
        });

        group.bench_with_input(
            BenchmarkId::new("query_by_sequence", records),
            &store,
            |b, s| {
                b.iter(|| {
                    let internal = format!("int-{}", rng.gen_range(0..SEQUENCES));
                    let query = SenderQuery {
                        internal_sequence_id: Some(internal),
                        send: Some(true),
                        ..Default::default()
                    };
                    black_box(s.snapshot::<SenderBean, _>(&query).len())
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("rms_by_sequence_id", records),
            &store,
            |b, s| {
                b.iter(|| {
                    let id = format!("seq-{}", rng.gen_range(0..SEQUENCES));
                    let query = RmsQuery::by_sequence_id(id);
                    black_box(s.snapshot::<RmsBean, _>(&query).len())
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("locked_retrieve_commit", records),
            &store,
            |b, s| {
                b.iter(|| {
                    let key = format!("msg-{}", rng.gen_range(0..records));
                    let Ok(mut tx) = s.begin() else { return };
                    let bean = tx.retrieve::<SenderBean>(&key).ok().flatten();
                    black_box(bean);
                    black_box(tx.commit().is_ok());
                })
            },
        );
    }

    group.finish();
}
