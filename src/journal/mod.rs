//! # Double-Write Journal
//!
//! Torn-write protection for the active segment. Every record is written
//! to this sync'd journal **before** the main file, then its entry is
//! flipped to `COMMITTED` once the main write lands (or `INCOMPLETE` if
//! it fails). A crash at any instant therefore leaves the record either
//! intact in the main file, or replayable from a `PENDING`/`COMMITTED`
//! journal entry — never silently lost, and never half-applied.
//!
//! # On-disk layout
//!
//! ```text
//! [version:u16][entry_count:u32]                      — 6-byte header
//! [status:u8][position:u64][length:u32][bytes][crc32] — per entry
//! ...
//! ```
//!
//! Status codes: `0 = PENDING`, `1 = COMMITTED`, `2 = INCOMPLETE`. The
//! trailing CRC32 covers `position || length || bytes` and deliberately
//! excludes the status byte, so the in-place status flip never
//! invalidates it. Entries whose CRC fails (a torn journal tail) end the
//! replay scan.
//!
//! The journal is fsynced on every append and every status flip, in all
//! WAL durability modes. Relaxing this would forfeit the torn-write
//! guarantee, so it is not configurable.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Entry appended, main write not yet confirmed.
pub const STATUS_PENDING: u8 = 0;

/// Main write confirmed durable.
pub const STATUS_COMMITTED: u8 = 1;

/// Main write failed; entry must be discarded on replay.
pub const STATUS_INCOMPLETE: u8 = 2;

/// Size of the journal file header.
const JOURNAL_HEADER_SIZE: u64 = 6;

/// Fixed bytes per entry besides the record bytes themselves:
/// status + position + length + trailing CRC.
const ENTRY_OVERHEAD: usize = 1 + 8 + 4 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Journal header failed validation.
    #[error("Invalid journal header: {0}")]
    InvalidHeader(String),

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Replay result
// ------------------------------------------------------------------------------------------------

/// Outcome of a startup journal replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries whose bytes were rewritten into the main file.
    pub replayed: usize,

    /// Entries already intact in the main file.
    pub verified: usize,

    /// `INCOMPLETE` entries discarded.
    pub discarded: usize,
}

// ------------------------------------------------------------------------------------------------
// Journal
// ------------------------------------------------------------------------------------------------

/// The double-write journal paired with one active segment file.
///
/// Owned by the WAL writer and only ever touched under the writer lock,
/// so it carries no synchronization of its own.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
    entry_count: u32,
    /// Current append offset (end of the last complete entry).
    write_offset: u64,
}

impl Journal {
    /// Opens or creates the journal at `path`.
    ///
    /// A fresh journal gets a header written and synced immediately. An
    /// existing one has its header validated; its entries are left for
    /// [`Self::replay`].
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let entry_count = if len == 0 {
            file.write_all(&JOURNAL_VERSION.to_le_bytes())?;
            file.write_all(&0u32.to_le_bytes())?;
            file.sync_all()?;
            info!(path = %path.display(), "journal created");
            0
        } else {
            let mut header = [0u8; JOURNAL_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header).map_err(|_| {
                JournalError::InvalidHeader("journal shorter than its header".into())
            })?;

            let version = u16::from_le_bytes(header[0..2].try_into().expect("fixed size"));
            if version != JOURNAL_VERSION {
                return Err(JournalError::InvalidHeader(format!(
                    "unsupported version {version}"
                )));
            }
            u32::from_le_bytes(header[2..6].try_into().expect("fixed size"))
        };

        let write_offset = len.max(JOURNAL_HEADER_SIZE);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            entry_count,
            write_offset,
        })
    }

    /// Appends a `PENDING` entry for a record about to be written to the
    /// main file at `position`, and fsyncs.
    ///
    /// Returns the entry's offset, used by [`Self::commit`] /
    /// [`Self::abandon`] to flip its status byte.
    pub fn begin(&mut self, position: u64, bytes: &[u8]) -> Result<u64, JournalError> {
        let entry_offset = self.write_offset;

        let mut entry = Vec::with_capacity(ENTRY_OVERHEAD + bytes.len());
        entry.push(STATUS_PENDING);
        entry.extend_from_slice(&position.to_le_bytes());
        entry.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        entry.extend_from_slice(bytes);
        let crc = crc32fast::hash(&entry[1..]);
        entry.extend_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::Start(entry_offset))?;
        self.file.write_all(&entry)?;

        self.entry_count += 1;
        self.file.seek(SeekFrom::Start(2))?;
        self.file.write_all(&self.entry_count.to_le_bytes())?;
        self.file.sync_all()?;

        self.write_offset = entry_offset + entry.len() as u64;

        trace!(
            position,
            len = bytes.len(),
            offset = entry_offset,
            "journal entry pending"
        );
        Ok(entry_offset)
    }

    /// Flips the entry at `entry_offset` to `COMMITTED` and fsyncs.
    pub fn commit(&mut self, entry_offset: u64) -> Result<(), JournalError> {
        self.set_status(entry_offset, STATUS_COMMITTED)
    }

    /// Flips the entry at `entry_offset` to `INCOMPLETE` and fsyncs.
    ///
    /// Called when the main-file write failed; replay will discard it.
    pub fn abandon(&mut self, entry_offset: u64) -> Result<(), JournalError> {
        self.set_status(entry_offset, STATUS_INCOMPLETE)
    }

    fn set_status(&mut self, entry_offset: u64, status: u8) -> Result<(), JournalError> {
        self.file.seek(SeekFrom::Start(entry_offset))?;
        self.file.write_all(&[status])?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays surviving entries into `main` after a restart.
    ///
    /// For every `PENDING` or `COMMITTED` entry whose bytes are absent,
    /// truncated, or damaged in the main file at its recorded position,
    /// the journal's copy is rewritten there. `INCOMPLETE` entries are
    /// discarded. On success the main file is fsynced and the journal is
    /// reset to empty.
    pub fn replay(&mut self, main: &mut File) -> Result<ReplayStats, JournalError> {
        let mut stats = ReplayStats::default();

        let len = self.file.metadata()?.len();
        if len <= JOURNAL_HEADER_SIZE {
            return Ok(stats);
        }

        let mut raw = Vec::with_capacity((len - JOURNAL_HEADER_SIZE) as usize);
        self.file.seek(SeekFrom::Start(JOURNAL_HEADER_SIZE))?;
        self.file.read_to_end(&mut raw)?;

        let mut offset = 0usize;
        let mut dirty = false;
        while offset + ENTRY_OVERHEAD <= raw.len() {
            let status = raw[offset];
            let position =
                u64::from_le_bytes(raw[offset + 1..offset + 9].try_into().expect("bounds ok"));
            let length =
                u32::from_le_bytes(raw[offset + 9..offset + 13].try_into().expect("bounds ok"))
                    as usize;

            let bytes_start = offset + 13;
            let Some(crc_end) = bytes_start.checked_add(length + 4) else {
                warn!("journal entry length overflows; stopping replay scan");
                break;
            };
            if crc_end > raw.len() {
                // Torn journal tail — the entry was never fully synced,
                // so its record never reached step 2 of the protocol.
                warn!(offset, "torn journal tail entry ignored");
                break;
            }

            let bytes = &raw[bytes_start..bytes_start + length];
            let stored_crc = u32::from_le_bytes(
                raw[bytes_start + length..crc_end]
                    .try_into()
                    .expect("bounds ok"),
            );
            if crc32fast::hash(&raw[offset + 1..bytes_start + length]) != stored_crc {
                warn!(offset, "journal entry checksum mismatch; stopping replay scan");
                break;
            }

            match status {
                STATUS_PENDING | STATUS_COMMITTED => {
                    if Self::main_has_bytes(main, position, bytes)? {
                        stats.verified += 1;
                    } else {
                        main.seek(SeekFrom::Start(position))?;
                        main.write_all(bytes)?;
                        dirty = true;
                        stats.replayed += 1;
                        debug!(position, len = length, "journal entry replayed into main file");
                    }
                }
                STATUS_INCOMPLETE => {
                    stats.discarded += 1;
                }
                other => {
                    warn!(status = other, "unknown journal entry status; stopping replay scan");
                    break;
                }
            }

            offset = crc_end;
        }

        if dirty {
            main.sync_all()?;
        }

        self.reset()?;

        if stats.replayed > 0 || stats.discarded > 0 {
            info!(
                replayed = stats.replayed,
                verified = stats.verified,
                discarded = stats.discarded,
                "journal replay complete"
            );
        }
        Ok(stats)
    }

    /// Returns `true` when `main` already holds exactly `bytes` at
    /// `position`.
    fn main_has_bytes(main: &mut File, position: u64, bytes: &[u8]) -> Result<bool, JournalError> {
        let main_len = main.metadata()?.len();
        if position + bytes.len() as u64 > main_len {
            return Ok(false);
        }
        let mut existing = vec![0u8; bytes.len()];
        main.seek(SeekFrom::Start(position))?;
        main.read_exact(&mut existing)?;
        Ok(existing == bytes)
    }

    /// Truncates the journal back to an empty header and fsyncs.
    ///
    /// Called after a successful replay and on every segment rotation —
    /// entry positions are only meaningful for the segment they were
    /// recorded against.
    pub fn reset(&mut self) -> Result<(), JournalError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&JOURNAL_VERSION.to_le_bytes())?;
        self.file.write_all(&0u32.to_le_bytes())?;
        self.file.sync_all()?;
        self.entry_count = 0;
        self.write_offset = JOURNAL_HEADER_SIZE;
        Ok(())
    }

    /// Number of entries appended since the last reset.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
