//! # Segment Reader
//!
//! Sequential, CRC-validating reads over a single segment file. The
//! reader tracks its own byte offset and seeks before every record, so
//! it can share the file with a concurrent appender and can be pointed
//! at an arbitrary offset with [`SegmentReader::seek`].
//!
//! Per-record failures are returned to the caller without poisoning the
//! reader; callers that want to continue past corruption hand the
//! segment to [`crate::recovery`] instead.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::trace;

use crate::record::{DEFAULT_MAX_PAYLOAD, HEADER_SIZE, Record, RecordError, RecordHeader};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by reader operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReaderError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record failed decoding at the reader's current offset.
    #[error("Record error at offset {offset}: {source}")]
    Record {
        offset: u64,
        #[source]
        source: RecordError,
    },
}

// ------------------------------------------------------------------------------------------------
// Timestamp extraction
// ------------------------------------------------------------------------------------------------

/// The timestamp a time-range query filters on.
///
/// Prefers the `timestamp` property inside a JSON payload (the event's
/// own clock); falls back to the record header timestamp for opaque or
/// foreign payloads.
pub fn effective_timestamp(record: &Record) -> i64 {
    serde_json::from_slice::<serde_json::Value>(&record.payload)
        .ok()
        .and_then(|v| v.get("timestamp")?.as_i64())
        .unwrap_or(record.timestamp_ns)
}

// ------------------------------------------------------------------------------------------------
// SegmentReader
// ------------------------------------------------------------------------------------------------

/// Streaming reader over one segment file.
#[derive(Debug)]
pub struct SegmentReader {
    file: File,
    path: PathBuf,
    offset: u64,
    max_payload: u32,
}

impl SegmentReader {
    /// Opens a segment for reading with the default payload limit.
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        Self::open_with_limit(path, DEFAULT_MAX_PAYLOAD)
    }

    /// Opens a segment for reading with an explicit payload limit.
    pub fn open_with_limit(path: &Path, max_payload: u32) -> Result<Self, ReaderError> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset: 0,
            max_payload,
        })
    }

    /// Reads the next record, advancing the offset past it.
    ///
    /// Returns `Ok(None)` at a clean end of file. A decode failure
    /// leaves the offset where the bad record started so the caller can
    /// inspect, reposition, or switch to recovery.
    pub fn read_next(&mut self) -> Result<Option<Record>, ReaderError> {
        let record_offset = self.offset;
        self.file.seek(SeekFrom::Start(record_offset))?;

        let mut header_buf = [0u8; HEADER_SIZE];
        match self.file.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(path = %self.path.display(), offset = record_offset, "reader reached end of segment");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let header = RecordHeader::decode(&header_buf).map_err(|source| ReaderError::Record {
            offset: record_offset,
            source,
        })?;

        let total = header.record_len();
        let mut buf = vec![0u8; total];
        buf[..HEADER_SIZE].copy_from_slice(&header_buf);
        self.file
            .read_exact(&mut buf[HEADER_SIZE..])
            .map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    let available = self
                        .file
                        .metadata()
                        .map(|m| m.len().saturating_sub(record_offset) as usize)
                        .unwrap_or(0);
                    ReaderError::Record {
                        offset: record_offset,
                        source: RecordError::Truncated {
                            needed: total,
                            available,
                        },
                    }
                } else {
                    ReaderError::Io(e)
                }
            })?;

        let (record, consumed) =
            Record::decode_with_limit(&buf, self.max_payload).map_err(|source| {
                ReaderError::Record {
                    offset: record_offset,
                    source,
                }
            })?;

        self.offset = record_offset + consumed as u64;
        Ok(Some(record))
    }

    /// Reads every record from the current offset to end of file.
    pub fn read_all(&mut self) -> Result<Vec<Record>, ReaderError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Reads all records whose effective timestamp falls within
    /// `[start_ns, end_ns]`, sorted by sequence.
    ///
    /// The effective timestamp is the payload's own `timestamp` property
    /// when the payload is JSON, otherwise the record header timestamp.
    pub fn read_range(
        &mut self,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<Record>, ReaderError> {
        let mut records: Vec<Record> = self
            .read_all()?
            .into_iter()
            .filter(|r| {
                let ts = effective_timestamp(r);
                ts >= start_ns && ts <= end_ns
            })
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Repositions the reader at an absolute byte offset.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Current byte offset — the start of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Path of the segment being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for SegmentReader {
    type Item = Result<Record, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}
