//! # Segment Manager
//!
//! A WAL is a sequence of **segment files**, each holding a contiguous
//! subrange of the sequence space. This module owns the ordered segment
//! list: discovery on startup, rotation naming, sealing, pruning, and
//! size refresh. The writer and the compactor both mutate the list, but
//! only through the manager's own lock.
//!
//! ## Naming
//!
//! For a WAL opened at `<dir>/audit.wal`:
//!
//! - `audit.wal` — the initial segment,
//! - `audit-YYYYMMDD-HHMMSS[-n].wal` — rotated segments (UTC timestamp,
//!   `-n` disambiguates same-second rotations),
//! - `compacted-<start><end>-<ts>.wal` — compactor output, registered
//!   after the atomic swap.
//!
//! ## Lifecycle
//!
//! Segments are created unsealed, appended to by the writer, sealed on
//! rotation, and thereafter immutable on disk except for the compactor's
//! atomic replace. Exactly one unsealed segment exists at any time.
//! Sealing is a metadata transition only — sealed files stay readable.
//!
//! Sequence bounds are recovered by decoding each file's first and last
//! records, never by parsing filenames.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{FORMAT_VERSION, HEADER_SIZE, PREFIX_SIZE, RecordError, RecordHeader};

/// Segment file extension.
pub const SEGMENT_EXT: &str = "wal";

/// Filename prefix of compactor-produced segments.
pub const COMPACTED_PREFIX: &str = "compacted-";

/// Default cap on retained sealed segments. Generous on purpose — heavy
/// rotation under small segment sizes must not silently drop audit data.
pub const DEFAULT_MAX_SEGMENTS: usize = 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment management operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record decode failure while establishing segment bounds.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Attempted to delete or rewrite the unsealed active segment.
    #[error("Segment is not sealed: {0}")]
    NotSealed(PathBuf),

    /// No segment with the given path is registered.
    #[error("Segment not found: {0}")]
    NotFound(PathBuf),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Segment metadata
// ------------------------------------------------------------------------------------------------

/// Metadata for one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Path of the segment file on disk.
    pub path: PathBuf,

    /// Sequence of the first record, 0 when the file is empty.
    pub start_seq: u64,

    /// Sequence of the last record, 0 when the file is empty.
    pub end_seq: u64,

    /// On-disk size in bytes.
    pub size: u64,

    /// Creation time, from file metadata.
    pub created_at: SystemTime,

    /// Sealed segments no longer accept appends.
    pub sealed: bool,

    /// Set when the file is missing or failed a bounds scan.
    pub corrupted: bool,

    /// Record format version observed in the first record.
    pub version: u16,
}

impl Segment {
    /// Age of the segment relative to `now`.
    pub fn age(&self, now: SystemTime) -> std::time::Duration {
        now.duration_since(self.created_at)
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Returns `true` when this file was produced by the compactor.
    pub fn is_compacted_output(&self) -> bool {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(COMPACTED_PREFIX))
    }
}

// ------------------------------------------------------------------------------------------------
// Bounds scan
// ------------------------------------------------------------------------------------------------

/// Result of a cheap bounds scan over a segment file.
#[derive(Debug, Default)]
struct SegmentBounds {
    start_seq: u64,
    end_seq: u64,
    version: u16,
    /// A decode failure occurred before EOF.
    damaged: bool,
}

/// Reads sequence bounds by stepping record headers, skipping payloads.
///
/// Stops at the first decode failure; everything scanned up to that
/// point is still used, and the segment is flagged damaged.
fn scan_bounds(path: &Path) -> Result<SegmentBounds, SegmentError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut bounds = SegmentBounds {
        version: FORMAT_VERSION,
        ..SegmentBounds::default()
    };
    let mut offset = 0u64;
    let mut prefix = [0u8; PREFIX_SIZE];
    let mut first = true;

    while offset + HEADER_SIZE as u64 <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        if file.read_exact(&mut prefix).is_err() {
            bounds.damaged = true;
            break;
        }

        let header = match RecordHeader::decode(&prefix) {
            Ok(h) => h,
            Err(_) => {
                bounds.damaged = true;
                break;
            }
        };

        let sequence = u64::from_le_bytes(prefix[24..32].try_into().expect("prefix is 64 bytes"));
        if first {
            bounds.start_seq = sequence;
            bounds.version = header.version;
            first = false;
        }
        bounds.end_seq = sequence;

        let record_len = header.record_len() as u64;
        if offset + record_len > file_len {
            // Torn tail — the writer's journal replay deals with it.
            bounds.damaged = true;
            break;
        }
        offset += record_len;
    }

    Ok(bounds)
}

// ------------------------------------------------------------------------------------------------
// SegmentManager
// ------------------------------------------------------------------------------------------------

/// Owns the ordered segment list of one WAL.
///
/// Internally synchronized; readers receive cloned snapshots and never
/// hold the manager lock across I/O.
#[derive(Debug)]
pub struct SegmentManager {
    /// Base path stem, e.g. `/var/log/audit` for a WAL at
    /// `/var/log/audit.wal`.
    stem: PathBuf,

    /// Directory containing all segment files.
    dir: PathBuf,

    /// Segments ordered oldest → newest; the last entry is active.
    segments: Mutex<Vec<Segment>>,

    /// Maximum number of sealed segments retained by [`Self::prune`].
    max_segments: usize,
}

impl SegmentManager {
    /// Discovers existing segments under the WAL base path.
    ///
    /// `base` is the WAL path itself (`<dir>/<name>.wal`). All files
    /// matching `<name>*.wal` or `compacted-*.wal` in the same directory
    /// are enumerated and ordered by modification time. The newest
    /// non-compacted file becomes the active segment; compactor outputs
    /// are always sealed.
    pub fn open(base: &Path, max_segments: usize) -> Result<Self, SegmentError> {
        let dir = base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let stem = base.with_extension("");
        let stem_name = stem
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SegmentError::Internal("WAL base path has no file name".into()))?
            .to_string();

        let mut discovered: Vec<(PathBuf, SystemTime)> = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let is_segment = name.strip_suffix(&format!(".{SEGMENT_EXT}")).is_some()
                    && (name.starts_with(&stem_name) || name.starts_with(COMPACTED_PREFIX));
                if is_segment {
                    let mtime = entry
                        .metadata()?
                        .modified()
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    discovered.push((path, mtime));
                }
            }
        }

        discovered.sort_by_key(|(_, mtime)| *mtime);

        // The newest non-compacted file stays appendable; everything
        // else is sealed.
        let active_idx = discovered
            .iter()
            .rposition(|(path, _)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with(COMPACTED_PREFIX))
            });

        let mut segments = Vec::with_capacity(discovered.len());
        for (idx, (path, _)) in discovered.iter().enumerate() {
            let sealed = Some(idx) != active_idx;
            segments.push(Self::load_segment(path, sealed)?);
        }

        info!(
            base = %base.display(),
            count = segments.len(),
            "segment manager initialized"
        );

        Ok(Self {
            stem,
            dir,
            segments: Mutex::new(segments),
            max_segments,
        })
    }

    /// Builds a [`Segment`] from a file on disk, scanning its bounds.
    fn load_segment(path: &Path, sealed: bool) -> Result<Segment, SegmentError> {
        let metadata = fs::metadata(path)?;
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let bounds = scan_bounds(path)?;
        if bounds.damaged {
            warn!(path = %path.display(), "segment bounds scan hit a decode failure");
        }

        Ok(Segment {
            path: path.to_path_buf(),
            start_seq: bounds.start_seq,
            end_seq: bounds.end_seq,
            size: metadata.len(),
            created_at,
            sealed,
            corrupted: bounds.damaged,
            version: bounds.version,
        })
    }

    /// Path of the initial segment for a fresh WAL.
    pub fn initial_path(&self) -> PathBuf {
        self.stem.with_extension(SEGMENT_EXT)
    }

    /// Registers a brand-new unsealed segment (fresh WAL or rotation
    /// target). The file must already exist.
    pub fn register_active(&self, path: &Path) -> Result<(), SegmentError> {
        let segment = Self::load_segment(path, false)?;
        let mut segments = self.lock()?;
        segments.push(segment);
        Ok(())
    }

    /// Registers an already-sealed segment (compactor output).
    pub fn register_sealed(&self, path: &Path) -> Result<(), SegmentError> {
        let mut segment = Self::load_segment(path, true)?;
        segment.sealed = true;
        let mut segments = self.lock()?;
        // Keep the list ordered by start sequence; compactor outputs
        // replace ranges in the middle of the history.
        let pos = segments
            .iter()
            .position(|s| !s.sealed || s.start_seq > segment.start_seq)
            .unwrap_or(segments.len());
        segments.insert(pos, segment);
        Ok(())
    }

    /// Seals the active segment and creates the next one.
    ///
    /// The sealed segment's `end_seq` is stamped with `current_seq`.
    /// Returns the path of the new active segment; its file is created
    /// empty with exclusive-create semantics.
    pub fn rotate(&self, current_seq: u64) -> Result<PathBuf, SegmentError> {
        let next_path = self.next_rotation_path()?;

        // Exclusive create: a colliding name means a racing writer,
        // which the single-writer contract forbids.
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&next_path)?;

        let mut segments = self.lock()?;
        if let Some(active) = segments.iter_mut().rev().find(|s| !s.sealed) {
            active.sealed = true;
            active.end_seq = current_seq;
            debug!(
                path = %active.path.display(),
                end_seq = current_seq,
                "segment sealed"
            );
        }
        drop(segments);

        self.register_active(&next_path)?;

        info!(path = %next_path.display(), "rotated to new segment");
        Ok(next_path)
    }

    /// Picks the next rotation filename, disambiguating same-second
    /// collisions with a numeric suffix.
    fn next_rotation_path(&self) -> Result<PathBuf, SegmentError> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let stem_name = self
            .stem
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SegmentError::Internal("WAL base path has no file name".into()))?;

        let candidate = self.dir.join(format!("{stem_name}-{stamp}.{SEGMENT_EXT}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        for n in 1..u32::MAX {
            let candidate = self
                .dir
                .join(format!("{stem_name}-{stamp}-{n}.{SEGMENT_EXT}"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(SegmentError::Internal(
            "rotation name space exhausted".into(),
        ))
    }

    /// Snapshot of the segment list, oldest → newest.
    pub fn snapshot(&self) -> Result<Vec<Segment>, SegmentError> {
        Ok(self.lock()?.clone())
    }

    /// Snapshot of the sealed segments only.
    pub fn sealed_segments(&self) -> Result<Vec<Segment>, SegmentError> {
        Ok(self.lock()?.iter().filter(|s| s.sealed).cloned().collect())
    }

    /// Metadata of the current active segment.
    pub fn active(&self) -> Result<Option<Segment>, SegmentError> {
        Ok(self.lock()?.iter().rev().find(|s| !s.sealed).cloned())
    }

    /// Updates the cached bounds of the active segment after appends.
    pub fn update_active(&self, end_seq: u64, size: u64) -> Result<(), SegmentError> {
        let mut segments = self.lock()?;
        if let Some(active) = segments.iter_mut().rev().find(|s| !s.sealed) {
            if active.start_seq == 0 {
                active.start_seq = end_seq;
            }
            active.end_seq = end_seq;
            active.size = size;
        }
        Ok(())
    }

    /// Removes a sealed segment from the list without touching the file.
    ///
    /// The compactor uses this right before archiving the file.
    pub fn remove(&self, path: &Path) -> Result<Segment, SegmentError> {
        let mut segments = self.lock()?;
        let idx = segments
            .iter()
            .position(|s| s.path == path)
            .ok_or_else(|| SegmentError::NotFound(path.to_path_buf()))?;
        if !segments[idx].sealed {
            return Err(SegmentError::NotSealed(path.to_path_buf()));
        }
        Ok(segments.remove(idx))
    }

    /// Deletes the oldest sealed segments beyond the retention cap.
    ///
    /// Returns the paths of deleted files. The active segment is never
    /// touched.
    pub fn prune(&self) -> Result<Vec<PathBuf>, SegmentError> {
        let mut segments = self.lock()?;
        let sealed_count = segments.iter().filter(|s| s.sealed).count();
        if sealed_count <= self.max_segments {
            return Ok(Vec::new());
        }

        let mut excess = sealed_count - self.max_segments;
        let mut deleted = Vec::new();
        segments.retain(|segment| {
            if excess > 0 && segment.sealed {
                if let Err(e) = fs::remove_file(&segment.path) {
                    warn!(path = %segment.path.display(), error = %e, "failed to prune segment");
                    return true;
                }
                deleted.push(segment.path.clone());
                excess -= 1;
                return false;
            }
            true
        });

        if !deleted.is_empty() {
            info!(count = deleted.len(), "pruned oldest sealed segments");
        }
        Ok(deleted)
    }

    /// Refreshes file sizes from disk; segments whose file vanished are
    /// marked corrupted.
    pub fn update_segment_sizes(&self) -> Result<(), SegmentError> {
        let mut segments = self.lock()?;
        for segment in segments.iter_mut() {
            match fs::metadata(&segment.path) {
                Ok(meta) => segment.size = meta.len(),
                Err(_) => {
                    warn!(path = %segment.path.display(), "segment file missing");
                    segment.corrupted = true;
                }
            }
        }
        Ok(())
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of registered segments.
    pub fn len(&self) -> Result<usize, SegmentError> {
        Ok(self.lock()?.len())
    }

    /// Returns `true` when no segments are registered.
    pub fn is_empty(&self) -> Result<bool, SegmentError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Segment>>, SegmentError> {
        self.segments
            .lock()
            .map_err(|_| SegmentError::Internal("Mutex poisoned".into()))
    }
}
