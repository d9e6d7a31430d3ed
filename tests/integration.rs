//! End-to-end scenarios across the whole engine: round trips, crash
//! emulation, torn writes, corruption recovery, rotation, compaction,
//! and index persistence.

use chainwal::compactor::{CompactionPolicy, Compactor};
use chainwal::event::{AuditEvent, Level};
use chainwal::index::WalIndex;
use chainwal::recovery::{RecoveryConfig, RecoveryEngine};
use chainwal::segment::{DEFAULT_MAX_SEGMENTS, SegmentManager};
use chainwal::wal::{Wal, WalOptions};
use rand::Rng;
use std::fs::OpenOptions;
use tempfile::TempDir;

fn event(message: &str) -> AuditEvent {
    AuditEvent::new(Level::Info, message)
}

fn message_of(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_owned))
        .unwrap_or_default()
}

// ----------------------------------------------------------------
// Basic round trip
// ----------------------------------------------------------------

#[test]
fn basic_round_trip_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");

    {
        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        wal.append(&event("a")).unwrap();
        wal.append(&event("b")).unwrap();
        wal.append(&event("c")).unwrap();
        wal.close().unwrap();
    }

    let wal = Wal::open(&base, WalOptions::default()).unwrap();
    let records = wal.read_all().unwrap();

    assert_eq!(
        records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        records
            .iter()
            .map(|r| message_of(&r.payload))
            .collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.total_records, 3);
}

// ----------------------------------------------------------------
// Crash emulation — files cut at arbitrary points
// ----------------------------------------------------------------

#[test]
fn abrupt_crash_leaves_a_clean_prefix() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");
    let journal = tmp.path().join("audit.wal.journal");

    {
        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        for i in 0..1000 {
            wal.append(&event(&format!("event {i}"))).unwrap();
        }
        // Dropped without close — as a killed process would leave it.
    }

    // Emulate the kill tearing both files at arbitrary byte offsets.
    let mut rng = rand::rng();
    for path in [&base, &journal] {
        let len = std::fs::metadata(path).unwrap().len();
        let keep = rng.random_range(len / 2..=len);
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(keep).unwrap();
        file.sync_all().unwrap();
    }

    let wal = Wal::open(&base, WalOptions::default()).unwrap();
    let records = wal.read_all().unwrap();

    assert!(!records.is_empty());
    assert!(records.len() <= 1000);
    for (idx, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, idx as u64 + 1, "no gaps, no partial tail");
    }

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
}

// ----------------------------------------------------------------
// Torn last record restored from the journal
// ----------------------------------------------------------------

#[test]
fn torn_last_record_is_restored_from_the_journal() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");

    {
        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        for i in 0..5 {
            wal.append(&event(&format!("event {i}"))).unwrap();
        }
    }

    // Truncate the main file at a random byte inside its last record.
    let len = std::fs::metadata(&base).unwrap().len();
    let cut = rand::rng().random_range(len - 80..len);
    let file = OpenOptions::new().write(true).open(&base).unwrap();
    file.set_len(cut).unwrap();
    file.sync_all().unwrap();

    let wal = Wal::open(&base, WalOptions::default()).unwrap();
    let records = wal.read_all().unwrap();
    assert_eq!(records.len(), 5, "journal must restore the torn record");
    assert_eq!(message_of(&records[4].payload), "event 4");

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
}

// ----------------------------------------------------------------
// Corruption sandwich recovered around
// ----------------------------------------------------------------

#[test]
fn recovery_reads_through_a_corruption_sandwich() {
    use chainwal::record::{Record, ZERO_HASH, hash_bytes};
    use std::io::Write;

    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("damaged.wal");

    let first = Record::new(1, ZERO_HASH, 1_000, br#"{"m":"before"}"#.to_vec()).encode();
    let second = Record::new(2, hash_bytes(&first), 2_000, br#"{"m":"after"}"#.to_vec()).encode();

    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&first).unwrap();
    file.write_all(&[0xBD; 22]).unwrap();
    file.write_all(&second).unwrap();
    file.sync_all().unwrap();

    let config = RecoveryConfig {
        skip_corrupted: true,
        verify_checksum: true,
        ..RecoveryConfig::default()
    };
    let (report, recovered) = RecoveryEngine::new(config).recover_file(&path).unwrap();

    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].payload, br#"{"m":"before"}"#);
    assert_eq!(recovered[1].payload, br#"{"m":"after"}"#);
    assert!(report.corrupted_records >= 1);
    assert!(report.skipped_bytes >= 22);
}

// ----------------------------------------------------------------
// Rotation under a tiny segment limit
// ----------------------------------------------------------------

#[test]
fn five_hundred_events_rotate_and_read_back_in_order() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");

    let options = WalOptions {
        segment_size: 1024,
        ..WalOptions::default()
    };
    let wal = Wal::open(&base, options).unwrap();
    for i in 0..500 {
        wal.append(&event(&format!("rotation filler event number {i:05}")))
            .unwrap();
    }

    let segments = wal.segment_manager().snapshot().unwrap();
    assert!(segments.len() >= 5, "got {} segments", segments.len());

    let records = wal.read_all().unwrap();
    assert_eq!(records.len(), 500);
    for (idx, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, idx as u64 + 1);
    }
    assert!(message_of(&records[499].payload).contains("00499"));

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
}

// ----------------------------------------------------------------
// Compaction with tombstones
// ----------------------------------------------------------------

#[test]
fn compaction_drops_tombstoned_records_and_rechains() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");

    let wal = Wal::open(&base, WalOptions::default()).unwrap();
    for i in 0..10 {
        wal.append(&event(&format!("event {i}"))).unwrap();
    }
    for seq in [2, 4, 8] {
        wal.mark_deleted(seq).unwrap();
    }
    // 10 events + 3 tombstones.
    assert_eq!(wal.read_all().unwrap().len(), 13);
    let size_before: u64 = wal
        .segment_manager()
        .snapshot()
        .unwrap()
        .iter()
        .map(|s| s.size)
        .sum();

    // Seal the active segment so the compactor may touch it.
    wal.rotate().unwrap();

    let stats = Compactor::new(CompactionPolicy::default())
        .force_compact(wal.segment_manager())
        .unwrap();
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);

    let records = wal.read_all().unwrap();
    assert_eq!(records.len(), 7, "10 events minus 3 tombstoned");
    assert_eq!(
        records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
        vec![1, 3, 5, 6, 7, 9, 10]
    );

    // Chain recomputed from zero in the compacted output.
    assert_eq!(records[0].prev_hash, chainwal::record::ZERO_HASH);
    for pair in records.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash());
    }

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);

    let size_after: u64 = wal
        .segment_manager()
        .snapshot()
        .unwrap()
        .iter()
        .map(|s| s.size)
        .sum();
    assert!(size_after < size_before);
}

// ----------------------------------------------------------------
// Index round trip over multiple segments
// ----------------------------------------------------------------

#[test]
fn index_round_trip_over_three_segments() {
    use chainwal::record::{Record, ZERO_HASH, hash_bytes};
    use std::io::Write;

    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("audit.wal");

    // 300 records, one second apart, starting two hours ago, spread
    // over three segment files.
    let base_time = chainwal::event::now_ns() - 2 * 3600 * 1_000_000_000;
    let second = 1_000_000_000i64;

    let paths = [
        tmp.path().join("audit-20240101-000000.wal"),
        tmp.path().join("audit-20240101-010000.wal"),
        base.clone(),
    ];
    let mut prev = ZERO_HASH;
    let mut seq = 1u64;
    for path in &paths {
        let mut file = std::fs::File::create(path).unwrap();
        for _ in 0..100 {
            let ts = base_time + (seq as i64 - 1) * second;
            let record = Record::new(seq, prev, ts, format!(r#"{{"n":{seq}}}"#).into_bytes());
            let bytes = record.encode();
            file.write_all(&bytes).unwrap();
            prev = hash_bytes(&bytes);
            seq += 1;
        }
        file.sync_all().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let segments = SegmentManager::open(&base, DEFAULT_MAX_SEGMENTS)
        .unwrap()
        .snapshot()
        .unwrap();
    assert_eq!(segments.len(), 3);

    let index = WalIndex::build(&segments).unwrap();
    let idx_path = WalIndex::index_path(&base);
    index.save(&idx_path).unwrap();

    let loaded = WalIndex::load(&idx_path).unwrap();
    assert_eq!(loaded.sequence_range(), Some((1, 300)));

    let hits = loaded.find_by_time_range(base_time + 30 * second, base_time + 60 * second);
    assert_eq!(hits.len(), 31, "inclusive 30-second window, one per second");
    assert!(
        hits.iter()
            .all(|e| e.timestamp_ns >= base_time + 30 * second
                && e.timestamp_ns <= base_time + 60 * second)
    );

    // The index finds exactly what a sequential scan finds.
    let entry = loaded.find_by_sequence(150).unwrap();
    let mut reader = chainwal::reader::SegmentReader::open(&entry.segment_path).unwrap();
    reader.seek(entry.offset);
    let record = reader.read_next().unwrap().unwrap();
    assert_eq!(record.sequence, 150);
}

// ----------------------------------------------------------------
// Repair produces a WAL the engine can open
// ----------------------------------------------------------------

#[test]
fn repaired_output_opens_as_a_fresh_wal() {
    use chainwal::record::{Record, ZERO_HASH, hash_bytes};
    use std::io::Write;

    let tmp = TempDir::new().unwrap();
    let damaged = tmp.path().join("damaged.wal");

    let first = Record::new(
        7,
        ZERO_HASH,
        1_000,
        br#"{"message":"salvage me","timestamp":1000}"#.to_vec(),
    )
    .encode();
    let second = Record::new(
        8,
        hash_bytes(&first),
        2_000,
        br#"{"message":"me too","timestamp":2000}"#.to_vec(),
    )
    .encode();
    let mut file = std::fs::File::create(&damaged).unwrap();
    file.write_all(&first).unwrap();
    file.write_all(&[0x00; 64]).unwrap();
    file.write_all(&second).unwrap();
    file.sync_all().unwrap();

    let engine = RecoveryEngine::new(RecoveryConfig::default());
    let (_, recovered) = engine.recover_file(&damaged).unwrap();
    assert_eq!(recovered.len(), 2);

    let repaired_dir = tmp.path().join("repaired");
    std::fs::create_dir(&repaired_dir).unwrap();
    let repaired = repaired_dir.join("audit.wal");
    engine.repair_to(&repaired, &recovered).unwrap();

    // The repaired file is a valid WAL: it opens, verifies, and accepts
    // new appends.
    let wal = Wal::open(&repaired, WalOptions::default()).unwrap();
    assert_eq!(wal.sequence().unwrap(), 2);

    let report = wal.verify_integrity().unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);

    assert_eq!(wal.append(&event("fresh")).unwrap(), 3);
}
