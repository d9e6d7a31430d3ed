//! # Index
//!
//! Sequence → location and time-range lookup over the segment set,
//! built by scanning segments and kept in memory as a sorted map. The
//! build validates only each record's self-validating header (magic,
//! version, header CRC) and steps over payloads — an order of magnitude
//! cheaper than full decodes, at the cost of trusting the data CRC to
//! the read path.
//!
//! ## Persistence
//!
//! `<stem>.idx` stores a versioned binary dump of the **per-segment
//! summaries** only, protected by a trailing CRC32:
//!
//! ```text
//! [version:u32][segment_count:u32]
//! per segment:
//!   [start_seq:u64][end_seq:u64][start_time_ns:i64][end_time_ns:i64]
//!   [size:i64][record_count:i32][path_len:u16][path bytes]
//! [crc32 over everything above]
//! ```
//!
//! Loading rescans the summarised segments to rebuild the entry map —
//! the summaries carry the bounds, the scan fills in the offsets. A
//! version bump invalidates the file rather than risking a misread.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{
    FLAG_DELETED, FORMAT_VERSION, HEADER_SIZE, PREFIX_SIZE, RecordHeader,
};
use crate::segment::Segment;

/// Index file format version.
pub const INDEX_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted index was written by a different format version.
    #[error("Index version mismatch: file has {found}, supported is {INDEX_VERSION}")]
    VersionMismatch { found: u32 },

    /// Segment carries records of an unsupported format version.
    #[error("Segment {path} has record version {found}")]
    SegmentVersionMismatch { path: PathBuf, found: u16 },

    /// Persisted index failed its checksum.
    #[error("Index checksum mismatch")]
    ChecksumMismatch,

    /// Persisted index is structurally invalid.
    #[error("Malformed index file: {0}")]
    Malformed(String),
}

// ------------------------------------------------------------------------------------------------
// Entry & summary types
// ------------------------------------------------------------------------------------------------

/// Location of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub sequence: u64,
    pub segment_path: PathBuf,
    pub offset: u64,
    pub size: u32,
    pub timestamp_ns: i64,
    pub header_crc: u32,
    pub flags: u16,
}

impl IndexEntry {
    /// Returns `true` when the DELETED flag is set.
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }
}

/// Aggregate facts about one indexed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub path: PathBuf,
    pub start_seq: u64,
    pub end_seq: u64,
    pub start_time_ns: i64,
    pub end_time_ns: i64,
    pub size: i64,
    pub record_count: i32,
    pub corrupted: bool,
}

// ------------------------------------------------------------------------------------------------
// WalIndex
// ------------------------------------------------------------------------------------------------

/// The in-memory index: a sorted sequence map plus per-segment
/// summaries.
#[derive(Debug, Default)]
pub struct WalIndex {
    entries: BTreeMap<u64, IndexEntry>,
    summaries: Vec<SegmentSummary>,
}

impl WalIndex {
    /// Builds an index by scanning the given segments.
    ///
    /// A segment whose first record carries a foreign format version is
    /// rejected outright; scan failures inside a segment mark it
    /// corrupted and keep whatever was indexed before the failure.
    pub fn build(segments: &[Segment]) -> Result<Self, IndexError> {
        let mut index = Self::default();
        for segment in segments {
            index.scan_segment(&segment.path)?;
        }
        info!(
            segments = index.summaries.len(),
            entries = index.entries.len(),
            "index built"
        );
        Ok(index)
    }

    /// Scans one segment file into the index.
    fn scan_segment(&mut self, path: &Path) -> Result<(), IndexError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut summary = SegmentSummary {
            path: path.to_path_buf(),
            start_seq: 0,
            end_seq: 0,
            start_time_ns: 0,
            end_time_ns: 0,
            size: file_len as i64,
            record_count: 0,
            corrupted: false,
        };

        let mut offset = 0u64;
        let mut prefix = [0u8; PREFIX_SIZE];
        let mut first = true;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;
            if file.read_exact(&mut prefix).is_err() {
                summary.corrupted = true;
                break;
            }

            let header = match RecordHeader::decode(&prefix) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "index scan stopped");
                    summary.corrupted = true;
                    break;
                }
            };

            if header.version != FORMAT_VERSION {
                return Err(IndexError::SegmentVersionMismatch {
                    path: path.to_path_buf(),
                    found: header.version,
                });
            }

            let record_len = header.record_len() as u64;
            if offset + record_len > file_len {
                summary.corrupted = true;
                break;
            }

            let sequence =
                u64::from_le_bytes(prefix[24..32].try_into().expect("prefix is 64 bytes"));

            if first {
                summary.start_seq = sequence;
                summary.start_time_ns = header.timestamp_ns;
                first = false;
            }
            summary.end_seq = sequence;
            summary.end_time_ns = header.timestamp_ns;
            summary.record_count += 1;

            self.entries.insert(
                sequence,
                IndexEntry {
                    sequence,
                    segment_path: path.to_path_buf(),
                    offset,
                    size: record_len as u32,
                    timestamp_ns: header.timestamp_ns,
                    header_crc: header.header_crc,
                    flags: header.flags,
                },
            );

            offset += record_len;
        }

        debug!(
            path = %path.display(),
            records = summary.record_count,
            corrupted = summary.corrupted,
            "segment indexed"
        );
        self.summaries.push(summary);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------------------------

    /// Location of the record with the given sequence.
    pub fn find_by_sequence(&self, sequence: u64) -> Option<&IndexEntry> {
        self.entries.get(&sequence)
    }

    /// Like [`Self::find_by_sequence`] but treats tombstoned records as
    /// absent.
    pub fn find_by_sequence_exclude_deleted(&self, sequence: u64) -> Option<&IndexEntry> {
        self.entries.get(&sequence).filter(|e| !e.is_deleted())
    }

    /// All entries whose timestamp lies in `[start_ns, end_ns]`, ordered
    /// by sequence.
    pub fn find_by_time_range(&self, start_ns: i64, end_ns: i64) -> Vec<&IndexEntry> {
        self.entries
            .values()
            .filter(|e| e.timestamp_ns >= start_ns && e.timestamp_ns <= end_ns)
            .collect()
    }

    /// Time-range lookup without tombstoned records.
    pub fn find_by_time_range_exclude_deleted(
        &self,
        start_ns: i64,
        end_ns: i64,
    ) -> Vec<&IndexEntry> {
        self.find_by_time_range(start_ns, end_ns)
            .into_iter()
            .filter(|e| !e.is_deleted())
            .collect()
    }

    /// Lowest and highest indexed sequence, when any records exist.
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        let first = self.entries.keys().next()?;
        let last = self.entries.keys().next_back()?;
        Some((*first, *last))
    }

    /// Per-segment summaries, in scan order.
    pub fn segment_info(&self) -> &[SegmentSummary] {
        &self.summaries
    }

    /// Forgets a segment and all of its entries.
    pub fn remove_segment(&mut self, path: &Path) {
        self.summaries.retain(|s| s.path != path);
        self.entries.retain(|_, e| e.segment_path != path);
    }

    /// Inserts (or replaces) one entry — used by the writer to keep a
    /// live index current without rescanning.
    pub fn add_entry(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.sequence, entry);
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Index file path for a WAL base path: `<stem>.idx`.
    pub fn index_path(base: &Path) -> PathBuf {
        base.with_extension("idx")
    }

    /// Writes the segment summaries to `path` (atomic tmp + rename).
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.summaries.len() as u32).to_le_bytes());

        for summary in &self.summaries {
            let path_bytes = summary.path.to_string_lossy();
            let path_bytes = path_bytes.as_bytes();

            buf.extend_from_slice(&summary.start_seq.to_le_bytes());
            buf.extend_from_slice(&summary.end_seq.to_le_bytes());
            buf.extend_from_slice(&summary.start_time_ns.to_le_bytes());
            buf.extend_from_slice(&summary.end_time_ns.to_le_bytes());
            buf.extend_from_slice(&summary.size.to_le_bytes());
            buf.extend_from_slice(&summary.record_count.to_le_bytes());
            buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(path_bytes);
        }

        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let tmp = path.with_extension("idx.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        info!(path = %path.display(), segments = self.summaries.len(), "index saved");
        Ok(())
    }

    /// Loads summaries from `path` and rebuilds the entry map by
    /// rescanning the summarised segments.
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let buf = fs::read(path)?;
        if buf.len() < 8 + 4 {
            return Err(IndexError::Malformed("file shorter than header".into()));
        }

        let (body, stored) = buf.split_at(buf.len() - 4);
        let stored_crc = u32::from_le_bytes(stored.try_into().expect("split at 4"));
        if crc32fast::hash(body) != stored_crc {
            return Err(IndexError::ChecksumMismatch);
        }

        let version = u32::from_le_bytes(body[0..4].try_into().expect("bounds checked"));
        if version != INDEX_VERSION {
            return Err(IndexError::VersionMismatch { found: version });
        }
        let segment_count = u32::from_le_bytes(body[4..8].try_into().expect("bounds checked"));

        let mut offset = 8usize;
        let mut paths = Vec::with_capacity(segment_count as usize);
        for _ in 0..segment_count {
            // start_seq + end_seq + start_time + end_time + size +
            // record_count + path_len.
            const FIXED: usize = 8 + 8 + 8 + 8 + 8 + 4 + 2;
            if offset + FIXED > body.len() {
                return Err(IndexError::Malformed("truncated segment summary".into()));
            }
            let path_len = u16::from_le_bytes(
                body[offset + FIXED - 2..offset + FIXED]
                    .try_into()
                    .expect("bounds checked"),
            ) as usize;
            if offset + FIXED + path_len > body.len() {
                return Err(IndexError::Malformed("truncated segment path".into()));
            }
            let path_str =
                std::str::from_utf8(&body[offset + FIXED..offset + FIXED + path_len])
                    .map_err(|_| IndexError::Malformed("segment path is not UTF-8".into()))?;
            paths.push(PathBuf::from(path_str));
            offset += FIXED + path_len;
        }

        // The summaries gave us the bounds; a rescan restores offsets.
        let mut index = Self::default();
        for path in &paths {
            if path.exists() {
                index.scan_segment(path)?;
            } else {
                warn!(path = %path.display(), "indexed segment missing on load");
            }
        }

        info!(path = %path.display(), segments = index.summaries.len(), "index loaded");
        Ok(index)
    }
}
