use crate::record::{FLAG_DELETED, Record, ZERO_HASH, hash_bytes};
use crate::segment::{DEFAULT_MAX_SEGMENTS, SegmentManager};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One record to be written into a fixture segment.
pub struct Spec {
    pub sequence: u64,
    pub payload: String,
    pub deleted: bool,
}

impl Spec {
    pub fn live(sequence: u64, payload: &str) -> Self {
        Self {
            sequence,
            payload: payload.to_string(),
            deleted: false,
        }
    }

    /// A tombstone record naming `target`.
    pub fn tombstone(sequence: u64, target: u64) -> Self {
        Self {
            sequence,
            payload: format!(r#"{{"tombstone_of":{target}}}"#),
            deleted: true,
        }
    }
}

/// Writes a chained segment file from specs.
pub fn write_segment(path: &Path, specs: &[Spec]) {
    let mut file = File::create(path).unwrap();
    let mut prev = ZERO_HASH;
    for spec in specs {
        let mut record = Record::new(
            spec.sequence,
            prev,
            spec.sequence as i64 * 1_000,
            spec.payload.clone().into_bytes(),
        );
        if spec.deleted {
            record.flags |= FLAG_DELETED;
        }
        let bytes = record.encode();
        file.write_all(&bytes).unwrap();
        prev = hash_bytes(&bytes);
    }
    file.sync_all().unwrap();
}

/// Opens a manager over a base path plus pre-written sealed segments.
///
/// `sealed` paths must already exist; an empty active file is created
/// at `base` afterwards so everything else counts as sealed history.
pub fn manager_with_sealed(base: &Path, sealed: &[PathBuf]) -> SegmentManager {
    for path in sealed {
        assert!(path.exists(), "fixture segment missing: {}", path.display());
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    File::create(base).unwrap().sync_all().unwrap();
    SegmentManager::open(base, DEFAULT_MAX_SEGMENTS).unwrap()
}

/// Decodes every record of a segment file.
pub fn decode_all(path: &Path) -> Vec<Record> {
    let buf = std::fs::read(path).unwrap();
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (record, consumed) = Record::decode(&buf[offset..]).unwrap();
        records.push(record);
        offset += consumed;
    }
    records
}
