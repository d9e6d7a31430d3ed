//! Index construction and lookup semantics.

#[cfg(test)]
mod tests {
    use crate::index::WalIndex;
    use crate::record::{FLAG_DELETED, Record, ZERO_HASH, hash_bytes};
    use crate::segment::{DEFAULT_MAX_SEGMENTS, SegmentManager};
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    /// Writes records with the given (sequence, timestamp, flags)
    /// triples; payloads are small JSON blobs.
    fn write_segment(path: &Path, specs: &[(u64, i64, u16)]) {
        let mut file = File::create(path).unwrap();
        let mut prev = ZERO_HASH;
        for &(seq, ts, flags) in specs {
            let mut record = Record::new(seq, prev, ts, format!(r#"{{"n":{seq}}}"#).into_bytes());
            record.flags = flags;
            let bytes = record.encode();
            file.write_all(&bytes).unwrap();
            prev = hash_bytes(&bytes);
        }
        file.sync_all().unwrap();
    }

    fn segments_for(base: &Path) -> Vec<crate::segment::Segment> {
        SegmentManager::open(base, DEFAULT_MAX_SEGMENTS)
            .unwrap()
            .snapshot()
            .unwrap()
    }

    #[test]
    fn build_indexes_every_record_with_offsets() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        write_segment(&base, &[(1, 100, 0), (2, 200, 0), (3, 300, 0)]);

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.sequence_range(), Some((1, 3)));

        let entry = index.find_by_sequence(2).unwrap();
        assert_eq!(entry.timestamp_ns, 200);
        assert_eq!(entry.segment_path, base);

        // The offset must point at the record a sequential scan finds.
        let first = index.find_by_sequence(1).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(entry.offset, u64::from(first.size));
    }

    #[test]
    fn build_spans_multiple_segments() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        let old = tmp.path().join("audit-20240101-000000.wal");
        write_segment(&old, &[(1, 100, 0), (2, 200, 0)]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_segment(&base, &[(3, 300, 0), (4, 400, 0)]);

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.sequence_range(), Some((1, 4)));
        assert_eq!(index.find_by_sequence(2).unwrap().segment_path, old);
        assert_eq!(index.find_by_sequence(3).unwrap().segment_path, base);
        assert_eq!(index.segment_info().len(), 2);
    }

    #[test]
    fn deleted_records_are_excluded_on_request() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        write_segment(&base, &[(1, 100, 0), (2, 200, FLAG_DELETED), (3, 300, 0)]);

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        assert!(index.find_by_sequence(2).is_some());
        assert!(index.find_by_sequence_exclude_deleted(2).is_none());
        assert!(index.find_by_sequence_exclude_deleted(3).is_some());

        assert_eq!(index.find_by_time_range(100, 300).len(), 3);
        assert_eq!(index.find_by_time_range_exclude_deleted(100, 300).len(), 2);
    }

    #[test]
    fn time_range_bounds_are_inclusive() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        write_segment(&base, &[(1, 100, 0), (2, 200, 0), (3, 300, 0), (4, 400, 0)]);

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        let hits = index.find_by_time_range(200, 300);
        assert_eq!(
            hits.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn summaries_capture_bounds_and_counts() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        write_segment(&base, &[(5, 500, 0), (6, 600, 0), (7, 700, 0)]);

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        let info = &index.segment_info()[0];
        assert_eq!(info.start_seq, 5);
        assert_eq!(info.end_seq, 7);
        assert_eq!(info.start_time_ns, 500);
        assert_eq!(info.end_time_ns, 700);
        assert_eq!(info.record_count, 3);
        assert!(!info.corrupted);
    }

    #[test]
    fn remove_segment_drops_its_entries() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        let old = tmp.path().join("audit-20240101-000000.wal");
        write_segment(&old, &[(1, 100, 0)]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_segment(&base, &[(2, 200, 0)]);

        let mut index = WalIndex::build(&segments_for(&base)).unwrap();
        index.remove_segment(&old);

        assert!(index.find_by_sequence(1).is_none());
        assert_eq!(index.segment_info().len(), 1);
        assert_eq!(index.sequence_range(), Some((2, 2)));
    }

    #[test]
    fn foreign_record_version_rejects_the_segment() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        let mut record = Record::new(1, ZERO_HASH, 100, b"{}".to_vec());
        record.version = 9;
        std::fs::write(&base, record.encode()).unwrap();

        let err = WalIndex::build(&segments_for(&base)).unwrap_err();
        assert!(matches!(
            err,
            crate::index::IndexError::SegmentVersionMismatch { found: 9, .. }
        ));
    }

    #[test]
    fn corrupt_tail_marks_summary_and_keeps_prefix() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");
        write_segment(&base, &[(1, 100, 0), (2, 200, 0)]);

        // Append a half record.
        let torn = Record::new(3, ZERO_HASH, 300, b"torn".to_vec()).encode();
        let mut file = std::fs::OpenOptions::new().append(true).open(&base).unwrap();
        file.write_all(&torn[..40]).unwrap();
        file.sync_all().unwrap();

        let index = WalIndex::build(&segments_for(&base)).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.segment_info()[0].corrupted);
    }
}
