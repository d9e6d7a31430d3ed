//! # Recovery Engine
//!
//! Reads records out of damaged segment files. Two escalating modes:
//!
//! **Standard recovery** decodes sequentially and, when a record fails,
//! resynchronises on the next header magic — scanning forward byte by
//! byte through sliding 4 KiB windows (4-byte overlap so a magic
//! straddling a window boundary is not missed). A candidate is accepted
//! when it decodes cleanly. Skipped bytes and corrupted regions are
//! counted in the [`RecoveryReport`].
//!
//! **Forensic recovery** (opt-in via
//! [`RecoveryConfig::enable_forensic`]) layers heuristics on top:
//!
//! - *Hash-chain reconstruction* — a candidate whose `prev_hash` equals
//!   the last good record's hash continues the chain; one sharing at
//!   least an 8-byte SHA-256 prefix is treated as a plausible fork.
//! - *Single-bit CRC repair* — if flipping exactly one of the 160
//!   header bits makes the header CRC match, the flipped header is
//!   accepted.
//! - *Pattern validation* — a structurally-decodable candidate that
//!   fails the chain checks is still accepted when its timestamp is
//!   plausible (within the last 10 years, no more than 24 h ahead),
//!   its flags are recognised, and its payload parses as JSON.
//! - *Deep scan* — when structural reconstruction yields nothing,
//!   balanced `{…}` JSON objects are pulled straight out of the bytes;
//!   their sequence numbers are unknown.
//! - *Shadow recovery* — a `<path>.shadow` sibling, if present, is
//!   decoded with relaxed CRC verification and merged.
//!
//! Every heuristic acceptance is recorded in
//! [`RecoveryReport::forensic_notes`] so an auditor can judge each one.
//!
//! [`RecoveryEngine::repair_to`] writes the recovered payloads to a
//! fresh, fully-valid segment: sequences reassigned from 1, hash chain
//! rebuilt from zero, flags cleared, original event timestamps kept
//! where extractable.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{
    DEFAULT_MAX_PAYLOAD, FLAGS_MASK, HASH_SIZE, HEADER_SIZE, MAGIC_HEADER, Record, RecordError,
    ZERO_HASH, hash_bytes,
};

/// Resync window size for the forward magic scan.
const RESYNC_WINDOW: usize = 4096;

/// Overlap between adjacent resync windows, covering a magic that
/// straddles the boundary.
const RESYNC_OVERLAP: usize = 4;

/// SHA-256 prefix length (bytes) treated as a plausible chain fork.
const FORK_PREFIX_LEN: usize = 8;

/// Upper bound on a deep-scanned JSON object.
const DEEP_SCAN_MAX_OBJECT: usize = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by recovery operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecoveryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Recovery completed but not a single payload survived.
    #[error("No recoverable data in {0}")]
    NoRecoverableData(PathBuf),

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning knobs for a recovery pass.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Upper bound on a record payload considered decodable.
    pub max_record_size: u32,

    /// Resynchronise past corrupt regions instead of stopping at the
    /// first failure.
    pub skip_corrupted: bool,

    /// Verify CRCs while decoding. Disabled only for last-resort reads
    /// of media with known bit rot.
    pub verify_checksum: bool,

    /// Enable the forensic heuristics documented at module level.
    pub enable_forensic: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_record_size: DEFAULT_MAX_PAYLOAD,
            skip_corrupted: true,
            verify_checksum: true,
            enable_forensic: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Results
// ------------------------------------------------------------------------------------------------

/// How a recovered record was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    /// Plain sequential decode.
    Sequential,
    /// Accepted after a forward magic resync.
    MagicResync,
    /// Accepted because its `prev_hash` continued (or plausibly forked)
    /// the chain.
    ChainReconstruction,
    /// Accepted after a single-bit header CRC repair.
    CrcBitRepair,
    /// Accepted on timestamp/flags/JSON plausibility alone.
    PatternMatch,
    /// Extracted by the balanced-JSON deep scan; sequence unknown.
    DeepScan,
    /// Merged from the shadow file.
    Shadow,
}

/// One record pulled out of a damaged file.
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    /// Original sequence, when the record structure survived.
    pub sequence: Option<u64>,

    /// Header timestamp (or 0 for deep-scanned objects).
    pub timestamp_ns: i64,

    /// Original flags.
    pub flags: u16,

    /// The event payload.
    pub payload: Vec<u8>,

    /// How this record was obtained.
    pub method: RecoveryMethod,
}

/// Outcome of a recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records seen, good and bad.
    pub total_records: u64,

    /// Records recovered intact (all methods).
    pub recovered_records: u64,

    /// Distinct corrupt regions encountered.
    pub corrupted_records: u64,

    /// Bytes stepped over during resyncs.
    pub skipped_bytes: u64,

    /// Sequence of the last record recovered through the structural
    /// path.
    pub last_good_sequence: u64,

    /// One entry per heuristic acceptance, for audit.
    pub forensic_notes: Vec<String>,

    /// Decode errors encountered along the way.
    pub errors: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// RecoveryEngine
// ------------------------------------------------------------------------------------------------

/// Drives standard and forensic recovery over segment files.
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Recovers everything readable from one segment file.
    pub fn recover_file(
        &self,
        path: &Path,
    ) -> Result<(RecoveryReport, Vec<RecoveredRecord>), RecoveryError> {
        let buf = fs::read(path)?;
        let mut report = RecoveryReport::default();
        let mut records = Vec::new();

        self.structural_pass(&buf, &mut report, &mut records);

        if self.config.enable_forensic {
            if records.is_empty() {
                self.deep_scan(&buf, &mut report, &mut records);
            }
            self.shadow_pass(path, &mut report, &mut records)?;
        }

        info!(
            path = %path.display(),
            recovered = report.recovered_records,
            corrupted = report.corrupted_records,
            skipped = report.skipped_bytes,
            "recovery pass complete"
        );
        Ok((report, records))
    }

    /// Writes recovered records to a fresh segment at `dest`.
    ///
    /// Sequences are reassigned 1..N, the hash chain is rebuilt from
    /// zero, flags are cleared, and each record keeps its original event
    /// timestamp where one is extractable (payload `timestamp` property,
    /// else the surviving header timestamp).
    pub fn repair_to(
        &self,
        dest: &Path,
        records: &[RecoveredRecord],
    ) -> Result<u64, RecoveryError> {
        if records.is_empty() {
            return Err(RecoveryError::NoRecoverableData(dest.to_path_buf()));
        }

        let mut file = OpenOptions::new().create_new(true).write(true).open(dest)?;

        let mut prev: [u8; HASH_SIZE] = ZERO_HASH;
        for (idx, recovered) in records.iter().enumerate() {
            let timestamp = payload_timestamp(&recovered.payload).unwrap_or(recovered.timestamp_ns);
            let record = Record::new(idx as u64 + 1, prev, timestamp, recovered.payload.clone());
            let bytes = record.encode();
            file.write_all(&bytes)?;
            prev = hash_bytes(&bytes);
        }
        file.sync_all()?;

        info!(dest = %dest.display(), count = records.len(), "repaired WAL written");
        Ok(records.len() as u64)
    }

    // --------------------------------------------------------------------------------------------
    // Structural pass
    // --------------------------------------------------------------------------------------------

    /// Sequential decode with magic resync on failure.
    fn structural_pass(
        &self,
        buf: &[u8],
        report: &mut RecoveryReport,
        records: &mut Vec<RecoveredRecord>,
    ) {
        let mut offset = 0usize;
        let mut last_good_hash: [u8; HASH_SIZE] = ZERO_HASH;
        let mut resyncing = false;

        while offset < buf.len() {
            match self.try_decode(&buf[offset..]) {
                Ok((record, consumed, method)) => {
                    let method = if resyncing {
                        self.classify_acceptance(&record, &last_good_hash, report, method)
                    } else {
                        if method == Some(RecoveryMethod::CrcBitRepair) {
                            report.forensic_notes.push(format!(
                                "sequence {}: single-bit header CRC repair in place",
                                record.sequence
                            ));
                        }
                        method
                    };
                    let Some(method) = method else {
                        // Forensic rejected this candidate; resume the
                        // scan one byte further.
                        offset += 1;
                        report.skipped_bytes += 1;
                        continue;
                    };

                    last_good_hash = hash_bytes(&buf[offset..offset + consumed]);
                    report.total_records += 1;
                    report.recovered_records += 1;
                    report.last_good_sequence = record.sequence;
                    records.push(RecoveredRecord {
                        sequence: Some(record.sequence),
                        timestamp_ns: record.timestamp_ns,
                        flags: record.flags,
                        payload: record.payload,
                        method,
                    });
                    offset += consumed;
                    resyncing = false;
                }
                Err(e) => {
                    if offset + HEADER_SIZE > buf.len() {
                        // Trailing fragment shorter than a header: count
                        // it as skipped tail, not a corrupt record.
                        report.skipped_bytes += (buf.len() - offset) as u64;
                        break;
                    }

                    report
                        .errors
                        .push(format!("offset {offset}: {e}"));
                    report.total_records += 1;
                    report.corrupted_records += 1;

                    if !self.config.skip_corrupted {
                        break;
                    }

                    match self.resync(buf, offset + 1) {
                        Some(next) => {
                            report.skipped_bytes += (next - offset) as u64;
                            debug!(
                                from = offset,
                                to = next,
                                "resynchronised on header magic"
                            );
                            offset = next;
                            resyncing = true;
                        }
                        None => {
                            report.skipped_bytes += (buf.len() - offset) as u64;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Attempts a decode at the front of `slice`, applying the
    /// configured checksum policy and, in forensic mode, the single-bit
    /// CRC repair.
    fn try_decode(
        &self,
        slice: &[u8],
    ) -> Result<(Record, usize, Option<RecoveryMethod>), RecordError> {
        let strict = if self.config.verify_checksum {
            Record::decode_with_limit(slice, self.config.max_record_size)
        } else {
            Record::decode_relaxed(slice, self.config.max_record_size)
        };

        match strict {
            Ok((record, consumed)) => Ok((record, consumed, Some(RecoveryMethod::Sequential))),
            Err(e @ RecordError::HeaderCrcMismatch { .. }) if self.config.enable_forensic => {
                match self.repair_single_bit(slice) {
                    Some((record, consumed)) => {
                        Ok((record, consumed, Some(RecoveryMethod::CrcBitRepair)))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Flips each of the 160 header bits looking for the one flip that
    /// makes the stored header CRC match.
    fn repair_single_bit(&self, slice: &[u8]) -> Option<(Record, usize)> {
        if slice.len() < HEADER_SIZE {
            return None;
        }
        let stored_crc = u32::from_le_bytes(slice[20..24].try_into().expect("bounds checked"));

        let mut header: [u8; 20] = slice[0..20].try_into().expect("bounds checked");
        for bit in 0..160 {
            let (byte, mask) = (bit / 8, 1u8 << (bit % 8));
            header[byte] ^= mask;
            if crc32fast::hash(&header) == stored_crc {
                // Rebuild the record with the repaired header byte and
                // retry a full strict decode (the data CRC covers the
                // header too, so it now has a chance to match).
                let payload_len =
                    u32::from_le_bytes(header[8..12].try_into().expect("bounds checked"));
                if payload_len <= self.config.max_record_size {
                    let total = crate::record::RECORD_OVERHEAD + payload_len as usize;
                    if slice.len() >= total {
                        let mut repaired = slice[..total].to_vec();
                        repaired[byte] ^= mask;
                        if let Ok((record, consumed)) =
                            Record::decode_with_limit(&repaired, self.config.max_record_size)
                        {
                            return Some((record, consumed));
                        }
                    }
                }
            }
            header[byte] ^= mask;
        }
        None
    }

    /// Decides whether a post-resync candidate is trustworthy.
    ///
    /// Standard mode accepts any clean decode. Forensic mode requires
    /// chain continuity, a plausible fork, or pattern validation — and
    /// logs which one fired.
    fn classify_acceptance(
        &self,
        record: &Record,
        last_good_hash: &[u8; HASH_SIZE],
        report: &mut RecoveryReport,
        method: Option<RecoveryMethod>,
    ) -> Option<RecoveryMethod> {
        if !self.config.enable_forensic {
            return Some(RecoveryMethod::MagicResync);
        }

        if record.prev_hash == *last_good_hash {
            report.forensic_notes.push(format!(
                "sequence {}: chain intact after resync",
                record.sequence
            ));
            return Some(RecoveryMethod::ChainReconstruction);
        }

        if *last_good_hash != ZERO_HASH
            && record.prev_hash[..FORK_PREFIX_LEN] == last_good_hash[..FORK_PREFIX_LEN]
        {
            report.forensic_notes.push(format!(
                "sequence {}: accepted as chain fork (shared prefix {})",
                record.sequence,
                hex::encode(&record.prev_hash[..FORK_PREFIX_LEN])
            ));
            return Some(RecoveryMethod::ChainReconstruction);
        }

        if self.pattern_validates(record) {
            report.forensic_notes.push(format!(
                "sequence {}: accepted on pattern validation",
                record.sequence
            ));
            return Some(RecoveryMethod::PatternMatch);
        }

        // Preserve a CRC-repair classification even when the chain
        // checks were inconclusive but the repair already proved the
        // bytes.
        if method == Some(RecoveryMethod::CrcBitRepair) {
            report.forensic_notes.push(format!(
                "sequence {}: accepted via single-bit CRC repair",
                record.sequence
            ));
            return method;
        }

        warn!(sequence = record.sequence, "resync candidate rejected by forensic checks");
        None
    }

    /// Timestamp within [now − 10 years, now + 24 h], recognised flags,
    /// JSON payload.
    fn pattern_validates(&self, record: &Record) -> bool {
        let now = Utc::now();
        let low = (now - ChronoDuration::days(3650))
            .timestamp_nanos_opt()
            .unwrap_or(i64::MIN);
        let high = (now + ChronoDuration::hours(24))
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);

        record.timestamp_ns >= low
            && record.timestamp_ns <= high
            && record.flags & !FLAGS_MASK == 0
            && serde_json::from_slice::<serde_json::Value>(&record.payload).is_ok()
    }

    /// Forward scan for the next header magic, in sliding windows.
    fn resync(&self, buf: &[u8], from: usize) -> Option<usize> {
        let magic = MAGIC_HEADER.to_le_bytes();
        let mut window_start = from;

        while window_start < buf.len() {
            let window_end = (window_start + RESYNC_WINDOW).min(buf.len());
            let window = &buf[window_start..window_end];

            for idx in 0..window.len().saturating_sub(3) {
                if window[idx..idx + 4] == magic {
                    return Some(window_start + idx);
                }
            }

            if window_end == buf.len() {
                break;
            }
            // Step one window forward, re-examining the overlap so a
            // magic on the boundary is caught.
            window_start = window_end - RESYNC_OVERLAP;
        }
        None
    }

    // --------------------------------------------------------------------------------------------
    // Forensic extras
    // --------------------------------------------------------------------------------------------

    /// Pulls balanced JSON objects straight out of the bytes.
    fn deep_scan(
        &self,
        buf: &[u8],
        report: &mut RecoveryReport,
        records: &mut Vec<RecoveredRecord>,
    ) {
        let mut offset = 0usize;
        while offset < buf.len() {
            if buf[offset] != b'{' {
                offset += 1;
                continue;
            }
            match balanced_json_end(&buf[offset..]) {
                Some(len) if len <= DEEP_SCAN_MAX_OBJECT => {
                    let candidate = &buf[offset..offset + len];
                    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(candidate)
                        && value.is_object()
                        && looks_like_event(&value)
                    {
                        report.forensic_notes.push(format!(
                            "deep scan: {len}-byte JSON object at offset {offset}"
                        ));
                        report.recovered_records += 1;
                        records.push(RecoveredRecord {
                            sequence: None,
                            timestamp_ns: value
                                .get("timestamp")
                                .and_then(|t| t.as_i64())
                                .unwrap_or(0),
                            flags: 0,
                            payload: candidate.to_vec(),
                            method: RecoveryMethod::DeepScan,
                        });
                        offset += len;
                        continue;
                    }
                    offset += 1;
                }
                _ => offset += 1,
            }
        }
    }

    /// Recovers `<path>.shadow` with relaxed CRCs and merges records
    /// whose sequences are not already present.
    fn shadow_pass(
        &self,
        path: &Path,
        report: &mut RecoveryReport,
        records: &mut Vec<RecoveredRecord>,
    ) -> Result<(), RecoveryError> {
        let shadow = {
            let mut os = path.as_os_str().to_os_string();
            os.push(".shadow");
            PathBuf::from(os)
        };
        if !shadow.exists() {
            return Ok(());
        }

        let buf = fs::read(&shadow)?;
        let known: std::collections::HashSet<u64> =
            records.iter().filter_map(|r| r.sequence).collect();

        let mut offset = 0usize;
        let mut merged = 0usize;
        while offset < buf.len() {
            match Record::decode_relaxed(&buf[offset..], self.config.max_record_size) {
                Ok((record, consumed)) => {
                    if !known.contains(&record.sequence) {
                        records.push(RecoveredRecord {
                            sequence: Some(record.sequence),
                            timestamp_ns: record.timestamp_ns,
                            flags: record.flags,
                            payload: record.payload,
                            method: RecoveryMethod::Shadow,
                        });
                        report.recovered_records += 1;
                        merged += 1;
                    }
                    offset += consumed;
                }
                Err(_) => offset += 1,
            }
        }

        if merged > 0 {
            report
                .forensic_notes
                .push(format!("shadow file contributed {merged} records"));
            records.sort_by_key(|r| r.sequence.unwrap_or(u64::MAX));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Length of a balanced JSON object starting at `buf[0] == b'{'`, if
/// one closes within the buffer. String and escape aware.
fn balanced_json_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in buf.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// A deep-scanned object counts as an event when it carries at least a
/// timestamp or a message-ish field.
fn looks_like_event(value: &serde_json::Value) -> bool {
    value.get("timestamp").is_some() || value.get("message").is_some() || value.get("m").is_some()
}

/// Extracts a `timestamp` property from a JSON payload.
fn payload_timestamp(payload: &[u8]) -> Option<i64> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("timestamp")?
        .as_i64()
}
