//! # WAL Writer
//!
//! The single-writer engine at the heart of the log. Every append runs
//! the double-write protocol against the journal, maintains the SHA-256
//! hash chain, enforces the configured durability mode, and rotates the
//! active segment when it fills.
//!
//! ## Write path
//!
//! ```text
//! event ──► record codec ──► journal.begin (fsync)
//!                               │
//!                               ▼
//!                        main file append
//!                          │         │
//!                       ok ▼         ▼ error
//!                 journal.commit   journal.abandon
//!                       │               │
//!                       ▼               ▼
//!              policy fsync + rotate   error to caller
//! ```
//!
//! ## Durability modes
//!
//! - [`SyncMode::Immediate`] — every append fsyncs the main file. The
//!   default; an audit log should not trade durability for throughput
//!   unless told to.
//! - [`SyncMode::Batch`] — main fsync every N appends, plus on rotation
//!   and close.
//! - [`SyncMode::Interval`] — a background task fsyncs the main file on
//!   a timer; appends return without waiting for it.
//!
//! The journal is fsynced per append in **all** modes. Whatever the
//! mode, a record acknowledged to the caller is either durable in the
//! main file or replayable from a COMMITTED journal entry.
//!
//! ## Concurrency model
//!
//! One exclusive mutex guards the active file handle, the journal, the
//! sequence counter, and the running hash. Readers never take it — they
//! work from segment-manager snapshots. The background flush task takes
//! it only around the fsync call itself.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Sender, bounded, select, tick};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compactor::CompactionError;
use crate::event::AuditEvent;
use crate::journal::{Journal, JournalError};
use crate::record::{
    DEFAULT_MAX_PAYLOAD, FLAG_DELETED, HASH_SIZE, Record, RecordError, ZERO_HASH, hash_bytes,
};
use crate::segment::{DEFAULT_MAX_SEGMENTS, Segment, SegmentError, SegmentManager};

/// Default segment size limit before rotation (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default scratch-buffer capacity for record encoding.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default permissions for a freshly created WAL directory.
pub const DEFAULT_DIR_PERM: u32 = 0o700;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Failure while opening or re-establishing WAL state.
    #[error("Open failed: {0}")]
    Open(#[source] io::Error),

    /// Failure while appending to the main file.
    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    /// Failure while fsyncing the main file.
    #[error("Sync failed: {0}")]
    Sync(#[source] io::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Journal protocol failure.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Segment management failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Record codec failure.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Compaction failure surfaced through a WAL-level operation.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Payload exceeds the configured limit.
    #[error("Payload of {len} bytes exceeds limit ({max} bytes)")]
    PayloadTooLarge { len: usize, max: u32 },

    /// No record with the given sequence exists.
    #[error("Sequence not found: {0}")]
    NotFound(u64),

    /// The WAL has been closed.
    #[error("WAL is closed")]
    Closed,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// When the main segment file is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync on every append.
    Immediate,

    /// fsync every N appends, and on rotation and close.
    Batch(u32),

    /// A background task fsyncs on this period; appends do not wait.
    Interval(Duration),
}

/// Configuration for a [`Wal`] instance.
#[derive(Clone)]
pub struct WalOptions {
    /// Segment size limit; the active segment rotates at or above it.
    pub segment_size: u64,

    /// Main-file durability mode. The journal is always synced.
    pub sync_mode: SyncMode,

    /// Capacity of the writer's reusable encode buffer.
    pub buffer_size: usize,

    /// Retention cap handed to the segment manager.
    pub max_segments: usize,

    /// Upper bound on a single event payload.
    pub max_payload: u32,

    /// Mode bits for a freshly created WAL directory (Unix only).
    pub create_dir_perm: u32,

    /// Abort the process on any durability failure. Intentional for
    /// deployments where an audit trail that cannot be written must not
    /// silently continue.
    pub panic_on_failure: bool,

    /// Invoked with every durability failure before it propagates.
    pub failure_callback: Option<Arc<dyn Fn(&WalError) + Send + Sync>>,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::Immediate,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            create_dir_perm: DEFAULT_DIR_PERM,
            panic_on_failure: false,
            failure_callback: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Integrity reports
// ------------------------------------------------------------------------------------------------

/// Summary produced by [`Wal::verify_integrity`].
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// `true` when no errors were found.
    pub valid: bool,

    /// Records that decoded successfully across all segments.
    pub total_records: u64,

    /// Segments examined.
    pub total_segments: usize,

    /// Hash-chain restarts (zero `prev_hash` at a segment head —
    /// compacted or repaired history).
    pub chain_restarts: u64,

    /// Everything a careful auditor should see.
    pub errors: Vec<String>,
}

/// Per-segment detail produced by [`Wal::verify_integrity_detailed`].
#[derive(Debug)]
pub struct SegmentIntegrity {
    pub path: PathBuf,
    pub records: u64,
    pub start_seq: u64,
    pub end_seq: u64,
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Full integrity report: summary plus per-segment breakdown.
#[derive(Debug)]
pub struct DetailedIntegrityReport {
    pub summary: IntegrityReport,
    pub segments: Vec<SegmentIntegrity>,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// Mutable writer state, guarded by the writer mutex.
struct WalInner {
    /// Active segment file handle.
    active: File,

    /// Path of the active segment.
    active_path: PathBuf,

    /// Bytes of valid records in the active segment.
    active_size: u64,

    /// Double-write journal paired with the active segment.
    journal: Journal,

    /// Last assigned sequence number (0 before the first append).
    sequence: u64,

    /// SHA-256 of the last appended record's bytes.
    last_hash: [u8; HASH_SIZE],

    /// Appends since the last main-file fsync (Batch mode).
    writes_since_sync: u32,

    /// Reusable encode buffer.
    scratch: Vec<u8>,

    /// Set by [`Wal::close`]; all further writes fail with `Closed`.
    closed: bool,
}

/// Handle to the background interval-flush task.
struct FlushTask {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The write-ahead log engine.
///
/// Exclusive single-writer: exactly one `Wal` may own a base path at a
/// time; concurrent writers to the same path are undefined behaviour.
/// Readers ([`Wal::read_all`], [`crate::reader::SegmentReader`]) are
/// safe alongside the writer and observe whatever the durability policy
/// has committed.
pub struct Wal {
    inner: Arc<Mutex<WalInner>>,
    manager: Arc<SegmentManager>,
    options: WalOptions,
    base: PathBuf,
    flush_task: Mutex<Option<FlushTask>>,
}

impl Wal {
    /// Opens (or creates) a WAL rooted at `path` (e.g. `/audit/app.wal`).
    ///
    /// Creates the parent directory (mode `create_dir_perm` on Unix),
    /// discovers existing segments, replays the journal into the active
    /// segment, and recovers `sequence` and `last_hash` by scanning the
    /// tail. Journal replay failures are fatal: without a clean replay
    /// the durability invariant cannot be re-established.
    pub fn open(path: impl AsRef<Path>, options: WalOptions) -> Result<Self, WalError> {
        let base = path.as_ref().to_path_buf();

        // 1. Parent directory, restrictive permissions.
        if let Some(dir) = base.parent().filter(|p| !p.as_os_str().is_empty())
            && !dir.exists()
        {
            create_dir_restricted(dir, options.create_dir_perm).map_err(WalError::Open)?;
        }

        // 2. Segment discovery.
        let manager = Arc::new(SegmentManager::open(&base, options.max_segments)?);

        // 3. Establish the active segment file.
        let active_path = match manager.active()? {
            Some(segment) => segment.path,
            None => {
                let initial = manager.initial_path();
                OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(&initial)
                    .map_err(WalError::Open)?;
                manager.register_active(&initial)?;
                initial
            }
        };
        let mut active = open_segment_rw(&active_path).map_err(WalError::Open)?;

        // 4. Journal replay — always before trusting the tail.
        let mut journal = Journal::open(&journal_path(&base))?;
        journal.replay(&mut active)?;

        // 5. Tail scan — recover sequence, running hash, and valid size.
        let tail = scan_tail(&mut active, options.max_payload)?;
        let active_size = tail.valid_len;
        if tail.truncated_garbage > 0 {
            warn!(
                path = %active_path.display(),
                bytes = tail.truncated_garbage,
                "discarded unreplayable bytes past the last valid record"
            );
        }

        let (sequence, last_hash) = match tail.last {
            Some((seq, hash)) => (seq, hash),
            // Empty active segment: fall back to the newest sealed
            // history, if any.
            None => last_state_from_sealed(&manager, options.max_payload)?,
        };

        manager.update_active(sequence, active_size)?;

        info!(
            base = %base.display(),
            sequence,
            segments = manager.len()?,
            "WAL opened"
        );

        let wal = Self {
            inner: Arc::new(Mutex::new(WalInner {
                active,
                active_path,
                active_size,
                journal,
                sequence,
                last_hash,
                writes_since_sync: 0,
                scratch: Vec::with_capacity(options.buffer_size),
                closed: false,
            })),
            manager,
            options,
            base,
            flush_task: Mutex::new(None),
        };

        if let SyncMode::Interval(period) = wal.options.sync_mode {
            wal.spawn_flush_task(period)?;
        }

        Ok(wal)
    }

    /// Appends one event, returning its assigned sequence number.
    ///
    /// Blocks for at least the journal fsync; in `Immediate` mode also
    /// for the main-file fsync. Never returns success for a record that
    /// could be lost by a crash.
    pub fn append(&self, event: &AuditEvent) -> Result<u64, WalError> {
        self.append_record(event.timestamp_ns, 0, event.to_payload())
    }

    /// Appends a pre-serialized payload. The payload must be
    /// self-describing; callers layering their own transforms (masking,
    /// signing, encryption) use this instead of [`Self::append`].
    pub fn append_payload(&self, timestamp_ns: i64, payload: Vec<u8>) -> Result<u64, WalError> {
        self.append_record(timestamp_ns, 0, payload)
    }

    fn append_record(
        &self,
        timestamp_ns: i64,
        flags: u16,
        payload: Vec<u8>,
    ) -> Result<u64, WalError> {
        if payload.len() > self.options.max_payload as usize {
            return Err(WalError::PayloadTooLarge {
                len: payload.len(),
                max: self.options.max_payload,
            });
        }

        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(WalError::Closed);
        }
        self.append_record_locked(&mut inner, timestamp_ns, flags, payload)
    }

    /// Sequence assignment, encode, double-write, and rotate-if-full.
    /// Caller holds the writer lock.
    fn append_record_locked(
        &self,
        inner: &mut WalInner,
        timestamp_ns: i64,
        flags: u16,
        payload: Vec<u8>,
    ) -> Result<u64, WalError> {
        let sequence = inner.sequence + 1;
        let mut record = Record::new(sequence, inner.last_hash, timestamp_ns, payload);
        record.flags = flags;

        let mut bytes = std::mem::take(&mut inner.scratch);
        bytes.clear();
        record.encode_into(&mut bytes);

        let result = self.write_bytes_locked(inner, sequence, &bytes);
        inner.scratch = bytes;
        result?;

        // Rotation happens under the same lock: exactly one unsealed
        // segment may exist.
        if inner.active_size >= self.options.segment_size {
            self.rotate_locked(inner)?;
        }

        Ok(sequence)
    }

    /// The double-write protocol for one encoded record, plus state
    /// updates. Caller holds the writer lock.
    fn write_bytes_locked(
        &self,
        inner: &mut WalInner,
        sequence: u64,
        bytes: &[u8],
    ) -> Result<(), WalError> {
        let position = inner.active_size;

        // Step 1: journal first, always synced.
        let ticket = match inner.journal.begin(position, bytes) {
            Ok(t) => t,
            Err(e) => return Err(self.fail(WalError::Journal(e))),
        };

        // Step 2: main file append.
        let main_write = inner
            .active
            .seek(SeekFrom::Start(position))
            .and_then(|_| inner.active.write_all(bytes));
        if let Err(e) = main_write {
            // Step 3: the record never became durable in main — mark the
            // journal entry so replay discards it, then fail loud.
            if let Err(j) = inner.journal.abandon(ticket) {
                error!(error = %j, "failed to mark journal entry incomplete");
            }
            return Err(self.fail(WalError::Write(e)));
        }

        // Step 4: confirm.
        if let Err(e) = inner.journal.commit(ticket) {
            return Err(self.fail(WalError::Journal(e)));
        }

        // Policy fsync of the main file.
        match self.options.sync_mode {
            SyncMode::Immediate => {
                if let Err(e) = inner.active.sync_all() {
                    return Err(self.fail(WalError::Sync(e)));
                }
            }
            SyncMode::Batch(n) => {
                inner.writes_since_sync += 1;
                if inner.writes_since_sync >= n.max(1) {
                    if let Err(e) = inner.active.sync_all() {
                        return Err(self.fail(WalError::Sync(e)));
                    }
                    inner.writes_since_sync = 0;
                }
            }
            SyncMode::Interval(_) => {}
        }

        inner.sequence = sequence;
        inner.last_hash = hash_bytes(bytes);
        inner.active_size = position + bytes.len() as u64;
        self.manager.update_active(sequence, inner.active_size)?;

        Ok(())
    }

    /// Seals the active segment and starts a fresh one. Caller holds the
    /// writer lock.
    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if let Err(e) = inner.active.sync_all() {
            return Err(self.fail(WalError::Sync(e)));
        }

        let next_path = self.manager.rotate(inner.sequence)?;
        let next = open_segment_rw(&next_path).map_err(WalError::Open)?;

        inner.active = next;
        inner.active_path = next_path;
        inner.active_size = 0;
        inner.writes_since_sync = 0;

        // Journal positions referred to the sealed file; start clean.
        inner.journal.reset()?;

        if let Err(e) = self.manager.prune() {
            warn!(error = %e, "segment pruning failed after rotation");
        }

        debug!(sequence = inner.sequence, "rotation complete");
        Ok(())
    }

    /// Seals the active segment immediately, regardless of size.
    ///
    /// Operator surface: compaction only touches sealed segments, so a
    /// forced compaction of recent history starts with a forced
    /// rotation.
    pub fn rotate(&self) -> Result<(), WalError> {
        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(WalError::Closed);
        }
        self.rotate_locked(&mut inner)
    }

    /// Marks a record logically deleted.
    ///
    /// A target still in the active segment gets a tombstone record
    /// appended (DELETED flag, payload naming the dead sequence). A
    /// target in sealed history has its segment atomically rewritten
    /// with the DELETED bit set in place.
    ///
    /// Classification and the active-path append happen in one critical
    /// section under the writer mutex, so a concurrent append or
    /// rotation cannot reclassify the target between the check and the
    /// tombstone write.
    pub fn mark_deleted(&self, sequence: u64) -> Result<(), WalError> {
        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(WalError::Closed);
        }
        if sequence == 0 || sequence > inner.sequence {
            return Err(WalError::NotFound(sequence));
        }

        let active = self.manager.active()?;
        let in_active = active
            .as_ref()
            .is_some_and(|a| a.start_seq != 0 && sequence >= a.start_seq);

        if in_active {
            let payload = serde_json::json!({
                "tombstone_of": sequence,
                "timestamp": crate::event::now_ns(),
            })
            .to_string()
            .into_bytes();
            self.append_record_locked(&mut inner, crate::event::now_ns(), FLAG_DELETED, payload)?;
            return Ok(());
        }

        // Sealed is terminal: the target's segment can never become
        // active again, and the writer never touches sealed files, so
        // the rewrite itself runs without the writer mutex.
        drop(inner);
        crate::compactor::tombstone_sealed(&self.manager, sequence)?;
        Ok(())
    }

    /// fsyncs the active segment.
    pub fn flush(&self) -> Result<(), WalError> {
        let inner = self.lock_inner()?;
        if inner.closed {
            return Err(WalError::Closed);
        }
        inner.active.sync_all().map_err(WalError::Sync)
    }

    /// Stops background tasks, fsyncs, and closes the writer.
    ///
    /// Further appends fail with [`WalError::Closed`]. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        if let Some(task) = self
            .flush_task
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?
            .take()
        {
            let _ = task.stop.send(());
            if task.handle.join().is_err() {
                warn!("interval flush task panicked");
            }
        }

        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Ok(());
        }
        inner.active.sync_all().map_err(WalError::Sync)?;
        inner.closed = true;

        info!(base = %self.base.display(), sequence = inner.sequence, "WAL closed");
        Ok(())
    }

    /// Reads every record across all segments, ordered by sequence.
    pub fn read_all(&self) -> Result<Vec<Record>, WalError> {
        let segments = self.manager.snapshot()?;
        let mut records = Vec::new();
        for segment in &segments {
            let mut reader = crate::reader::SegmentReader::open_with_limit(
                &segment.path,
                self.options.max_payload,
            )
            .map_err(|e| WalError::Internal(format!("reader: {e}")))?;
            while let Some(record) = reader
                .read_next()
                .map_err(|e| WalError::Internal(format!("{}: {e}", segment.path.display())))?
            {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Last assigned sequence number.
    pub fn sequence(&self) -> Result<u64, WalError> {
        Ok(self.lock_inner()?.sequence)
    }

    /// The segment manager backing this WAL.
    pub fn segment_manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    /// WAL base path.
    pub fn base(&self) -> &Path {
        &self.base
    }

    // --------------------------------------------------------------------------------------------
    // Integrity verification
    // --------------------------------------------------------------------------------------------

    /// Walks every segment, validating CRCs, sequence ordering, and the
    /// hash chain. Cheap summary; see
    /// [`Self::verify_integrity_detailed`] for the per-segment view.
    pub fn verify_integrity(&self) -> Result<IntegrityReport, WalError> {
        Ok(self.verify_integrity_detailed()?.summary)
    }

    /// Full integrity verification with per-segment reports.
    pub fn verify_integrity_detailed(&self) -> Result<DetailedIntegrityReport, WalError> {
        match self.flush() {
            // Verification of a closed WAL is legitimate — the files on
            // disk are already synced.
            Ok(()) | Err(WalError::Closed) => {}
            Err(e) => return Err(e),
        }
        let segments = self.manager.snapshot()?;

        let mut summary = IntegrityReport {
            valid: true,
            total_segments: segments.len(),
            ..IntegrityReport::default()
        };
        let mut details = Vec::with_capacity(segments.len());

        let mut expected_prev: [u8; HASH_SIZE] = ZERO_HASH;
        let mut last_sequence = 0u64;

        for segment in &segments {
            let detail =
                verify_segment(segment, &mut expected_prev, &mut last_sequence, &mut summary);
            details.push(detail);
        }

        summary.valid = summary.errors.is_empty();
        Ok(DetailedIntegrityReport {
            summary,
            segments: details,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, WalInner>, WalError> {
        self.inner
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))
    }

    /// Surfaces a durability failure: callback first, then optional
    /// process abort, then propagation.
    fn fail(&self, err: WalError) -> WalError {
        error!(error = %err, "WAL durability failure");
        if let Some(callback) = &self.options.failure_callback {
            callback(&err);
        }
        if self.options.panic_on_failure {
            panic!("audit WAL failure: {err}");
        }
        err
    }

    /// Spawns the interval-flush task for [`SyncMode::Interval`].
    fn spawn_flush_task(&self, period: Duration) -> Result<(), WalError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let callback = self.options.failure_callback.clone();
        let ticker = tick(period);

        let handle = std::thread::Builder::new()
            .name("chainwal-flush".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let Ok(guard) = inner.lock() else { break };
                            if guard.closed {
                                break;
                            }
                            if let Err(e) = guard.active.sync_all() {
                                error!(error = %e, "interval flush failed");
                                if let Some(cb) = &callback {
                                    cb(&WalError::Sync(e));
                                }
                            }
                        }
                    }
                }
            })
            .map_err(|e| WalError::Internal(format!("failed to spawn flush task: {e}")))?;

        *self
            .flush_task
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))? = Some(FlushTask {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Best-effort: stop the flush task and sync whatever is open.
        if let Ok(mut task) = self.flush_task.lock()
            && let Some(task) = task.take()
        {
            let _ = task.stop.send(());
            let _ = task.handle.join();
        }
        match self.inner.lock() {
            Ok(inner) => {
                if !inner.closed && inner.active.sync_all().is_err() {
                    error!(base = %self.base.display(), "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let inner = poisoned.into_inner();
                let _ = inner.active.sync_all();
                warn!(base = %self.base.display(), "WAL dropped with poisoned writer lock");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Open-time helpers
// ------------------------------------------------------------------------------------------------

/// Journal path for a WAL base path: `<base>.journal`.
fn journal_path(base: &Path) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".journal");
    PathBuf::from(os)
}

/// Opens a segment file for the writer: read (replay, tail scan) plus
/// write at explicit positions.
fn open_segment_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Creates `dir` (and parents) with the given Unix mode.
#[cfg(unix)]
fn create_dir_restricted(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

#[cfg(not(unix))]
fn create_dir_restricted(dir: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Result of the active-segment tail scan.
struct TailScan {
    /// Sequence and hash of the last valid record, if any.
    last: Option<(u64, [u8; HASH_SIZE])>,

    /// Byte length of the valid record prefix.
    valid_len: u64,

    /// Garbage bytes discarded past the last valid record.
    truncated_garbage: u64,
}

/// Scans the active segment, recovering the last sequence and running
/// hash. Bytes past the last decodable record are truncated away — after
/// a clean journal replay they can only be pre-existing corruption that
/// appending must not build on.
fn scan_tail(file: &mut File, max_payload: u32) -> Result<TailScan, WalError> {
    let len = file.metadata()?.len();
    let mut buf = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;

    let mut offset = 0usize;
    let mut last = None;

    while offset < buf.len() {
        match Record::decode_with_limit(&buf[offset..], max_payload) {
            Ok((record, consumed)) => {
                last = Some((record.sequence, hash_bytes(&buf[offset..offset + consumed])));
                offset += consumed;
            }
            Err(_) => break,
        }
    }

    let truncated_garbage = len - offset as u64;
    if truncated_garbage > 0 {
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok(TailScan {
        last,
        valid_len: offset as u64,
        truncated_garbage,
    })
}

/// Recovers `(sequence, last_hash)` from sealed history when the active
/// segment is empty.
fn last_state_from_sealed(
    manager: &SegmentManager,
    max_payload: u32,
) -> Result<(u64, [u8; HASH_SIZE]), WalError> {
    let segments = manager.snapshot()?;
    let Some(newest) = segments
        .iter()
        .filter(|s| s.sealed && s.end_seq > 0)
        .max_by_key(|s| s.end_seq)
    else {
        return Ok((0, ZERO_HASH));
    };

    let mut file = File::open(&newest.path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut offset = 0usize;
    let mut last = None;
    while offset < buf.len() {
        match Record::decode_with_limit(&buf[offset..], max_payload) {
            Ok((record, consumed)) => {
                last = Some((record.sequence, hash_bytes(&buf[offset..offset + consumed])));
                offset += consumed;
            }
            Err(_) => break,
        }
    }
    Ok(last.unwrap_or((0, ZERO_HASH)))
}

// ------------------------------------------------------------------------------------------------
// Verification walk
// ------------------------------------------------------------------------------------------------

/// Verifies one segment, updating the chain/sequence state shared across
/// the walk.
fn verify_segment(
    segment: &Segment,
    expected_prev: &mut [u8; HASH_SIZE],
    last_sequence: &mut u64,
    summary: &mut IntegrityReport,
) -> SegmentIntegrity {
    let mut detail = SegmentIntegrity {
        path: segment.path.clone(),
        records: 0,
        start_seq: 0,
        end_seq: 0,
        valid: true,
        errors: Vec::new(),
    };

    let buf = match fs::read(&segment.path) {
        Ok(b) => b,
        Err(e) => {
            let msg = format!("{}: unreadable: {e}", segment.path.display());
            detail.errors.push(msg.clone());
            summary.errors.push(msg);
            detail.valid = false;
            return detail;
        }
    };

    let mut offset = 0usize;
    let mut first_in_segment = true;

    while offset < buf.len() {
        match Record::decode(&buf[offset..]) {
            Ok((record, consumed)) => {
                let bytes = &buf[offset..offset + consumed];

                // Chain check: either the exact predecessor hash, or a
                // sanctioned restart (zero hash at a segment head).
                if record.prev_hash != *expected_prev {
                    if first_in_segment && record.prev_hash == ZERO_HASH {
                        summary.chain_restarts += 1;
                    } else {
                        let msg = format!(
                            "{}: hash chain break at sequence {}",
                            segment.path.display(),
                            record.sequence
                        );
                        detail.errors.push(msg.clone());
                        summary.errors.push(msg);
                    }
                }

                if *last_sequence > 0 && record.sequence <= *last_sequence {
                    let msg = format!(
                        "{}: sequence {} not increasing (previous {})",
                        segment.path.display(),
                        record.sequence,
                        last_sequence
                    );
                    detail.errors.push(msg.clone());
                    summary.errors.push(msg);
                }

                if first_in_segment {
                    detail.start_seq = record.sequence;
                    first_in_segment = false;
                }
                detail.end_seq = record.sequence;
                detail.records += 1;
                summary.total_records += 1;

                *last_sequence = record.sequence;
                *expected_prev = hash_bytes(bytes);
                offset += consumed;
            }
            Err(e) => {
                let msg = format!(
                    "{}: decode failure at offset {offset}: {e}",
                    segment.path.display()
                );
                detail.errors.push(msg.clone());
                summary.errors.push(msg);
                break;
            }
        }
    }

    detail.valid = detail.errors.is_empty();
    detail
}
