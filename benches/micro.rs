//! Micro-benchmarks: record codec throughput and append latency per
//! durability mode.

use chainwal::event::{AuditEvent, Level};
use chainwal::record::{Record, ZERO_HASH};
use chainwal::wal::{SyncMode, Wal, WalOptions};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;

fn bench_record_codec(c: &mut Criterion) {
    let payload = br#"{"timestamp":1700000000000000000,"level":"info","message":"benchmark event","properties":{"user":"alice","entity_id":"acct-42"}}"#.to_vec();
    let record = Record::new(1, ZERO_HASH, 1_700_000_000_000_000_000, payload);
    let encoded = record.encode();

    c.bench_function("record_encode", |b| {
        b.iter(|| black_box(record.encode()));
    });

    c.bench_function("record_decode", |b| {
        b.iter(|| Record::decode(black_box(&encoded)).unwrap());
    });

    c.bench_function("record_hash", |b| {
        b.iter(|| black_box(record.hash()));
    });
}

fn bench_append(c: &mut Criterion) {
    let event = AuditEvent::new(Level::Info, "benchmark event")
        .with_property("user", serde_json::json!("alice"));

    let mut group = c.benchmark_group("append");
    group.sample_size(20);

    for (name, mode) in [
        ("batch_64", SyncMode::Batch(64)),
        (
            "interval_100ms",
            SyncMode::Interval(std::time::Duration::from_millis(100)),
        ),
    ] {
        group.bench_function(name, |b| {
            let tmp = TempDir::new().unwrap();
            let wal = Wal::open(
                tmp.path().join("bench.wal"),
                WalOptions {
                    sync_mode: mode,
                    ..WalOptions::default()
                },
            )
            .unwrap();
            b.iter(|| wal.append(black_box(&event)).unwrap());
            wal.close().unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record_codec, bench_append);
criterion_main!(benches);
