//! # Compactor
//!
//! Reclaims space from sealed segments: tombstoned and superseded
//! records are dropped, groups of small or sparse segments are merged
//! into fresh ones, and the originals are archived under a retention
//! clock. The active segment is never touched.
//!
//! ## Liveness
//!
//! A record is **dead** when any of:
//!
//! - its DELETED flag is set (tombstones are themselves dead),
//! - a tombstone record anywhere in the group names its sequence,
//! - a record with the same `entity_id` payload property and a higher
//!   sequence exists (superseded — only the newest version of an entity
//!   survives).
//!
//! ## Group protocol
//!
//! 1. Collect live records of the group in sequence order.
//! 2. Write them to `compacted-<start><end>-<ts>.wal.tmp` with the
//!    hash chain rebuilt from zero and the COMPACTED flag set, fsync,
//!    then atomically rename into place and fsync the directory.
//! 3. Register the new segment, remove the originals from the manager,
//!    and move their files into `<dir>/archive/` (rename; copy+delete
//!    as a fallback).
//!
//! A group that fails mid-protocol leaves its originals untouched and
//! registered — the error is accumulated in [`CompactionStats::errors`]
//! and the run continues with the next group.
//!
//! Archived files older than the retention period are deleted by
//! [`Compactor::reap_archive`], which the background loop calls after
//! every compaction round.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use crossbeam::channel::{Sender, bounded, select, tick};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::record::{
    FLAG_COMPACTED, FLAG_DELETED, HASH_SIZE, Record, RecordError, ZERO_HASH, hash_bytes,
};
use crate::segment::{COMPACTED_PREFIX, Segment, SegmentError, SegmentManager};

/// Payload property used for superseded-record detection.
pub const SUPERSEDE_KEY: &str = "entity_id";

/// Payload property a tombstone record uses to name its target.
pub const TOMBSTONE_KEY: &str = "tombstone_of";

/// Subdirectory that receives compacted-away originals.
pub const ARCHIVE_DIR: &str = "archive";

/// Deleted-record share above which [`Compactor::vacuum`] rewrites a
/// segment.
const VACUUM_DELETED_RATIO: f64 = 0.10;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment management failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Record codec failure.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// One group's protocol failed; carried inside the run's stats.
    #[error("Compaction failed for {segment}: {cause}")]
    Failed { segment: PathBuf, cause: String },

    /// No sealed segment contains the requested sequence.
    #[error("Sequence {0} not found in sealed segments")]
    SequenceNotFound(u64),

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Policy & stats
// ------------------------------------------------------------------------------------------------

/// When and how aggressively segments are compacted.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    /// A trailing (under-target) group runs only with at least this
    /// many segments.
    pub min_segments: usize,

    /// Only segments at least this old are eligible.
    pub max_segment_age: Duration,

    /// Segments smaller than this are candidates regardless of their
    /// live ratio.
    pub min_segment_size: u64,

    /// Groups aim for this output size.
    pub target_segment_size: u64,

    /// Archived originals older than this are deleted.
    pub retention_period: Duration,

    /// Segments whose live-data ratio is at or below this are
    /// candidates (0.0 – 1.0).
    pub compact_ratio: f64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_segments: 2,
            max_segment_age: Duration::from_secs(3600),
            min_segment_size: 1024 * 1024,
            target_segment_size: 64 * 1024 * 1024,
            retention_period: Duration::from_secs(30 * 24 * 3600),
            compact_ratio: 0.5,
        }
    }
}

/// Accumulated outcome of one compaction run.
#[derive(Debug, Default)]
pub struct CompactionStats {
    /// Groups rewritten successfully.
    pub groups_compacted: usize,

    /// Original segments consumed and archived.
    pub segments_compacted: usize,

    /// Live records carried into compacted output.
    pub records_kept: u64,

    /// Dead records dropped (tombstones, tombstoned, deleted).
    pub records_dropped: u64,

    /// Records dropped because a newer same-entity record existed.
    pub superseded_dropped: u64,

    /// Input bytes minus output bytes across all groups.
    pub bytes_reclaimed: u64,

    /// Archived files deleted by the retention reaper.
    pub archive_reaped: usize,

    /// Per-group failures; the run continues past each.
    pub errors: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// Segment analysis
// ------------------------------------------------------------------------------------------------

/// Liveness breakdown of one or more segments.
#[derive(Debug, Default)]
struct Analysis {
    records: Vec<Record>,
    total_bytes: u64,
    live_bytes: u64,
    /// Sequences named by tombstone records.
    tombstoned: HashSet<u64>,
    /// Highest sequence per entity key.
    winners: HashMap<String, u64>,
    deleted_count: u64,
}

impl Analysis {
    /// Decodes `paths` in order, accumulating liveness facts.
    fn scan(paths: &[&Path]) -> Result<Self, CompactionError> {
        let mut analysis = Self::default();

        for path in paths {
            let buf = fs::read(path)?;
            analysis.total_bytes += buf.len() as u64;

            let mut offset = 0usize;
            while offset < buf.len() {
                let (record, consumed) =
                    Record::decode(&buf[offset..]).map_err(|e| CompactionError::Failed {
                        segment: path.to_path_buf(),
                        cause: format!("decode at offset {offset}: {e}"),
                    })?;

                if record.flags & FLAG_DELETED != 0 {
                    analysis.deleted_count += 1;
                    if let Some(target) = tombstone_target(&record.payload) {
                        analysis.tombstoned.insert(target);
                    }
                }
                if let Some(key) = entity_key(&record.payload) {
                    let entry = analysis.winners.entry(key).or_insert(record.sequence);
                    if record.sequence > *entry {
                        *entry = record.sequence;
                    }
                }

                analysis.records.push(record);
                offset += consumed;
            }
        }

        // Liveness is decidable only once all tombstones and entity
        // winners are known.
        let mut offset_bytes = 0u64;
        for record in &analysis.records {
            let len = record.encoded_len() as u64;
            if analysis.is_live(record) {
                analysis.live_bytes += len;
            }
            offset_bytes += len;
        }
        debug_assert_eq!(offset_bytes, analysis.total_bytes);

        Ok(analysis)
    }

    /// A record survives compaction iff nothing marks it dead.
    fn is_live(&self, record: &Record) -> bool {
        if record.flags & FLAG_DELETED != 0 {
            return false;
        }
        if self.tombstoned.contains(&record.sequence) {
            return false;
        }
        if let Some(key) = entity_key(&record.payload)
            && self.winners.get(&key).copied() != Some(record.sequence)
        {
            return false;
        }
        true
    }

    fn live_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.live_bytes as f64 / self.total_bytes as f64
    }
}

/// Extracts the tombstone target sequence from a tombstone payload.
fn tombstone_target(payload: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get(TOMBSTONE_KEY)?
        .as_u64()
}

/// Extracts the entity key from a payload, including events that carry
/// it inside their `properties` map.
fn entity_key(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let key = value
        .get(SUPERSEDE_KEY)
        .or_else(|| value.get("properties")?.get(SUPERSEDE_KEY))?;
    key.as_str().map(str::to_owned)
}

// ------------------------------------------------------------------------------------------------
// Compactor
// ------------------------------------------------------------------------------------------------

/// Policy-driven compaction over one WAL's sealed segments.
#[derive(Debug, Clone, Default)]
pub struct Compactor {
    policy: CompactionPolicy,
}

impl Compactor {
    pub fn new(policy: CompactionPolicy) -> Self {
        Self { policy }
    }

    /// Runs one compaction round: pick eligible sealed segments, batch
    /// them into groups, and rewrite each group. Per-group failures are
    /// collected; the round itself only fails on bookkeeping errors.
    pub fn compact(&self, manager: &SegmentManager) -> Result<CompactionStats, CompactionError> {
        let eligible = self.eligible_segments(manager)?;
        let groups = self.group(eligible);
        self.compact_groups(manager, groups)
    }

    /// Compacts **all** sealed segments as one group, ignoring age and
    /// ratio thresholds. Operator-triggered.
    pub fn force_compact(
        &self,
        manager: &SegmentManager,
    ) -> Result<CompactionStats, CompactionError> {
        let mut sealed = manager.sealed_segments()?;
        sealed.sort_by_key(|s| s.start_seq);
        let groups = if sealed.is_empty() {
            Vec::new()
        } else {
            vec![sealed]
        };
        self.compact_groups(manager, groups)
    }

    /// Rewrites any sealed segment whose deleted-record share exceeds
    /// 10%, one segment per group.
    pub fn vacuum(&self, manager: &SegmentManager) -> Result<CompactionStats, CompactionError> {
        let mut groups = Vec::new();
        for segment in manager.sealed_segments()? {
            let analysis = match Analysis::scan(&[&segment.path]) {
                Ok(a) => a,
                Err(e) => {
                    warn!(path = %segment.path.display(), error = %e, "vacuum scan failed");
                    continue;
                }
            };
            let total = analysis.records.len() as f64;
            if total > 0.0 && analysis.deleted_count as f64 / total > VACUUM_DELETED_RATIO {
                groups.push(vec![segment]);
            }
        }
        self.compact_groups(manager, groups)
    }

    /// Deletes archived originals older than the retention period.
    pub fn reap_archive(&self, manager: &SegmentManager) -> Result<usize, CompactionError> {
        let archive = manager.dir().join(ARCHIVE_DIR);
        if !archive.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.policy.retention_period)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut reaped = 0usize;
        for entry in fs::read_dir(&archive)? {
            let entry = entry?;
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified < cutoff {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "archive reap failed");
                } else {
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            info!(reaped, "expired archive segments deleted");
        }
        Ok(reaped)
    }

    /// Spawns the periodic background loop (compact + reap). Returns a
    /// handle whose [`CompactorHandle::stop`] joins the thread.
    pub fn spawn(self, manager: Arc<SegmentManager>, interval: Duration) -> CompactorHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = std::thread::Builder::new()
            .name("chainwal-compactor".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            match self.compact(&manager) {
                                Ok(stats) if stats.groups_compacted > 0 => {
                                    info!(
                                        groups = stats.groups_compacted,
                                        reclaimed = stats.bytes_reclaimed,
                                        "background compaction round complete"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "background compaction failed"),
                            }
                            if let Err(e) = self.reap_archive(&manager) {
                                error!(error = %e, "archive reaping failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn compactor thread");

        CompactorHandle {
            stop: stop_tx,
            handle,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Eligibility & grouping
    // --------------------------------------------------------------------------------------------

    /// Sealed segments passing the policy gate, sorted by start
    /// sequence.
    fn eligible_segments(
        &self,
        manager: &SegmentManager,
    ) -> Result<Vec<Segment>, CompactionError> {
        let now = SystemTime::now();
        let mut eligible = Vec::new();

        for segment in manager.sealed_segments()? {
            if segment.corrupted {
                continue;
            }
            if segment.age(now) < self.policy.max_segment_age {
                continue;
            }
            let small = segment.size < self.policy.min_segment_size;
            let sparse = if small {
                // Small segments are candidates outright; skip the scan.
                false
            } else {
                match Analysis::scan(&[&segment.path]) {
                    Ok(a) => a.live_ratio() <= self.policy.compact_ratio,
                    Err(e) => {
                        warn!(path = %segment.path.display(), error = %e, "eligibility scan failed");
                        false
                    }
                }
            };
            if small || sparse {
                eligible.push(segment);
            }
        }

        eligible.sort_by_key(|s| s.start_seq);
        Ok(eligible)
    }

    /// Greedy contiguous batching toward the target output size.
    fn group(&self, eligible: Vec<Segment>) -> Vec<Vec<Segment>> {
        let mut groups = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut current_size = 0u64;

        for segment in eligible {
            current_size += segment.size;
            current.push(segment);
            if current_size >= self.policy.target_segment_size {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
        }

        // A trailing under-target group runs only when it is worth the
        // rewrite.
        if current.len() >= self.policy.min_segments
            || (!current.is_empty() && current_size >= self.policy.min_segment_size)
        {
            groups.push(current);
        } else if !current.is_empty() {
            debug!(
                skipped = current.len(),
                "trailing group below thresholds, deferred"
            );
        }

        groups
    }

    /// Runs the group protocol over each batch, accumulating stats.
    fn compact_groups(
        &self,
        manager: &SegmentManager,
        groups: Vec<Vec<Segment>>,
    ) -> Result<CompactionStats, CompactionError> {
        let mut stats = CompactionStats::default();

        for group in groups {
            if let Err(e) = compact_group(manager, &group, &mut stats) {
                let segment = group
                    .first()
                    .map(|s| s.path.display().to_string())
                    .unwrap_or_default();
                warn!(segment = %segment, error = %e, "group compaction failed");
                stats.errors.push(format!("{segment}: {e}"));
            }
        }

        stats.archive_reaped = self.reap_archive(manager)?;
        Ok(stats)
    }
}

/// Handle to a running background compactor loop.
pub struct CompactorHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl CompactorHandle {
    /// Signals the loop to stop and waits for it.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("compactor thread panicked");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Group protocol
// ------------------------------------------------------------------------------------------------

/// Rewrites one group of sealed segments into a fresh compacted
/// segment and archives the originals.
fn compact_group(
    manager: &SegmentManager,
    group: &[Segment],
    stats: &mut CompactionStats,
) -> Result<(), CompactionError> {
    if group.is_empty() {
        return Ok(());
    }

    let paths: Vec<&Path> = group.iter().map(|s| s.path.as_path()).collect();
    let analysis = Analysis::scan(&paths)?;

    let start_seq = group[0].start_seq;
    let end_seq = group.last().expect("group is non-empty").end_seq;

    // Collect live records in sequence order, dropping duplicates.
    let mut records = analysis.records.clone();
    records.sort_by_key(|r| r.sequence);

    let mut seen = HashSet::new();
    let mut live = Vec::new();
    for record in records {
        if !seen.insert(record.sequence) {
            continue;
        }
        if analysis.is_live(&record) {
            live.push(record);
        } else if record.flags & FLAG_DELETED != 0 || analysis.tombstoned.contains(&record.sequence)
        {
            stats.records_dropped += 1;
        } else {
            stats.superseded_dropped += 1;
        }
    }

    let dir = manager.dir();
    if !live.is_empty() {
        let output = compacted_path(dir, start_seq, end_seq);
        write_compacted(&output, &live)?;
        manager.register_sealed(&output)?;

        let output_size = fs::metadata(&output)?.len();
        stats.bytes_reclaimed += analysis.total_bytes.saturating_sub(output_size);
        stats.records_kept += live.len() as u64;

        info!(
            output = %output.display(),
            kept = live.len(),
            from_segments = group.len(),
            "group compacted"
        );
    } else {
        // Nothing survived — the originals simply retire.
        stats.bytes_reclaimed += analysis.total_bytes;
        info!(from_segments = group.len(), "group compacted to nothing");
    }

    // Retire the originals: out of the manager, into the archive.
    for segment in group {
        manager.remove(&segment.path)?;
        archive_file(dir, &segment.path)?;
        stats.segments_compacted += 1;
    }

    stats.groups_compacted += 1;
    Ok(())
}

/// Output path for a compacted group.
fn compacted_path(dir: &Path, start_seq: u64, end_seq: u64) -> PathBuf {
    dir.join(format!(
        "{COMPACTED_PREFIX}{start_seq:016x}-{end_seq:016x}-{}.wal",
        Utc::now().timestamp()
    ))
}

/// Writes records with a zero-origin chain and the COMPACTED flag,
/// atomically (tmp + fsync + rename + dir fsync).
fn write_compacted(output: &Path, live: &[Record]) -> Result<(), CompactionError> {
    let tmp = {
        let mut os = output.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    };
    // A leftover tmp from a crashed run never made it through rename;
    // it is safe to clear.
    let _ = fs::remove_file(&tmp);

    {
        let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        let mut prev: [u8; HASH_SIZE] = ZERO_HASH;
        for record in live {
            let mut rewritten = record.clone();
            rewritten.prev_hash = prev;
            rewritten.flags = (record.flags & !FLAG_DELETED) | FLAG_COMPACTED;
            let bytes = rewritten.encode();
            file.write_all(&bytes)?;
            prev = hash_bytes(&bytes);
        }
        file.sync_all()?;
    }

    fs::rename(&tmp, output)?;
    if let Some(dir) = output.parent()
        && let Ok(dir_handle) = File::open(dir)
    {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

/// Moves a retired segment into `<dir>/archive/`, preserving its name.
/// Rename first; copy + delete across filesystems.
fn archive_file(dir: &Path, path: &Path) -> Result<(), CompactionError> {
    let archive = dir.join(ARCHIVE_DIR);
    fs::create_dir_all(&archive)?;

    let name = path
        .file_name()
        .ok_or_else(|| CompactionError::Internal("segment path has no file name".into()))?;
    let dest = archive.join(name);

    if fs::rename(path, &dest).is_err() {
        fs::copy(path, &dest)?;
        fs::remove_file(path)?;
    }
    debug!(from = %path.display(), to = %dest.display(), "segment archived");
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Sealed tombstoning
// ------------------------------------------------------------------------------------------------

/// Atomically rewrites the sealed segment containing `sequence`, setting
/// its DELETED bit.
///
/// Records before the target keep their exact bytes; the target and
/// everything after it are re-encoded so the in-segment chain stays
/// linked. The hand-off hash into the **next** segment is not patched;
/// integrity verification surfaces the rewrite.
pub fn tombstone_sealed(
    manager: &SegmentManager,
    sequence: u64,
) -> Result<(), CompactionError> {
    let segment = manager
        .sealed_segments()?
        .into_iter()
        .find(|s| s.start_seq <= sequence && sequence <= s.end_seq)
        .ok_or(CompactionError::SequenceNotFound(sequence))?;

    let buf = fs::read(&segment.path)?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let (record, consumed) = Record::decode(&buf[offset..])?;
        records.push(record);
        offset += consumed;
    }

    let target_idx = records
        .iter()
        .position(|r| r.sequence == sequence)
        .ok_or(CompactionError::SequenceNotFound(sequence))?;

    let tmp = {
        let mut os = segment.path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    };
    let _ = fs::remove_file(&tmp);
    {
        let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        let mut prev: [u8; HASH_SIZE] = records
            .first()
            .map(|r| r.prev_hash)
            .unwrap_or(ZERO_HASH);

        for (idx, record) in records.iter().enumerate() {
            let bytes = if idx < target_idx {
                // Untouched prefix: byte-identical.
                record.encode()
            } else {
                let mut rewritten = record.clone();
                rewritten.prev_hash = prev;
                if idx == target_idx {
                    rewritten.flags |= FLAG_DELETED;
                }
                rewritten.encode()
            };
            prev = hash_bytes(&bytes);
            file.write_all(&bytes)?;
        }
        file.sync_all()?;
    }

    fs::rename(&tmp, &segment.path)?;
    if let Some(dir) = segment.path.parent()
        && let Ok(dir_handle) = File::open(dir)
    {
        let _ = dir_handle.sync_all();
    }

    info!(
        path = %segment.path.display(),
        sequence,
        "sealed record tombstoned in place"
    );
    Ok(())
}
