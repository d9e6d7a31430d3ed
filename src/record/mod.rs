//! # Record Codec
//!
//! Serialization of a single log record. The layout is fixed and
//! little-endian; every numeric offset below is part of the on-disk
//! contract and is relied upon by the reader, the recovery engine, and
//! the index builder.
//!
//! # On-disk layout
//!
//! ```text
//! offset  size  field
//! 0       4     magic_header   (0x4D544C47)
//! 4       2     version
//! 6       2     flags          (bit 0 = DELETED, bit 1 = COMPACTED)
//! 8       4     payload_len
//! 12      8     timestamp_ns
//! 20      4     crc32_header   (over bytes [0, 20))
//! 24      8     sequence
//! 32      32    prev_hash      (SHA-256 of the previous record's bytes)
//! 64      n     payload
//! 64+n    4     crc32_data     (over bytes [0, 64+n))
//! 68+n    4     magic_footer   (0x454E4452)
//! ```
//!
//! Total size is `72 + payload_len`. The header CRC makes the first 24
//! bytes self-validating, which lets scans reason about a record before
//! touching its payload; the data CRC covers everything before it; the
//! footer magic bounds the record so torn tails are detected without
//! trusting `payload_len` alone.
//!
//! `prev_hash` chains each record to the full serialized bytes of its
//! predecessor. The first record of a log (and the first record of a
//! compacted or repaired segment) carries an all-zero hash.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Record header magic, `"GLTM"` in little-endian byte order.
pub const MAGIC_HEADER: u32 = 0x4D54_4C47;

/// Record footer magic, `"RDNE"` in little-endian byte order.
pub const MAGIC_FOOTER: u32 = 0x454E_4452;

/// Current record format version.
pub const FORMAT_VERSION: u16 = 1;

/// Record was logically deleted (tombstone, or tombstoned in place).
pub const FLAG_DELETED: u16 = 0x0001;

/// Record was rewritten by the compactor; its `prev_hash` chain restarts
/// from zero at the head of its segment.
pub const FLAG_COMPACTED: u16 = 0x0002;

/// All flag bits with a defined meaning.
pub const FLAGS_MASK: u16 = FLAG_DELETED | FLAG_COMPACTED;

/// Size of the self-validating header: fields plus header CRC.
pub const HEADER_SIZE: usize = 24;

/// Bytes before the payload begins: header + sequence + prev_hash.
pub const PREFIX_SIZE: usize = 64;

/// Fixed bytes added to every payload: prefix + data CRC + footer.
pub const RECORD_OVERHEAD: usize = PREFIX_SIZE + 4 + 4;

/// Width of the SHA-256 chain hash.
pub const HASH_SIZE: usize = 32;

/// The all-zero hash carried by chain-origin records.
pub const ZERO_HASH: [u8; HASH_SIZE] = [0u8; HASH_SIZE];

/// Default upper bound on payload size (10 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 10 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by record encoding and decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// Header magic does not match [`MAGIC_HEADER`].
    #[error("Bad header magic: {found:#010x}")]
    BadMagic { found: u32 },

    /// Header CRC32 over bytes [0, 20) does not match.
    #[error("Header CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderCrcMismatch { expected: u32, actual: u32 },

    /// Data CRC32 over everything before it does not match.
    #[error("Data CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    DataCrcMismatch { expected: u32, actual: u32 },

    /// Footer magic does not match [`MAGIC_FOOTER`].
    #[error("Bad footer magic: {found:#010x}")]
    BadFooter { found: u32 },

    /// Declared payload length exceeds the configured limit.
    #[error("Payload length {len} exceeds limit ({max} bytes)")]
    LengthOverflow { len: u32, max: u32 },

    /// Buffer ends before the record does.
    #[error("Truncated record: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

// ------------------------------------------------------------------------------------------------
// RecordHeader
// ------------------------------------------------------------------------------------------------

/// The decoded self-validating prefix of a record.
///
/// Carries everything a scan needs to step over a record without reading
/// its payload. Produced by [`RecordHeader::decode`], which validates the
/// header magic and CRC but deliberately nothing after byte 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u16,
    pub flags: u16,
    pub payload_len: u32,
    pub timestamp_ns: i64,
    /// The stored header CRC, kept for index entries.
    pub header_crc: u32,
}

impl RecordHeader {
    /// Decodes and validates the first [`HEADER_SIZE`] bytes of a record.
    pub fn decode(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < HEADER_SIZE {
            return Err(RecordError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length checked"));
        if magic != MAGIC_HEADER {
            return Err(RecordError::BadMagic { found: magic });
        }

        let expected = u32::from_le_bytes(buf[20..24].try_into().expect("slice length checked"));
        let actual = crc32fast::hash(&buf[0..20]);
        if actual != expected {
            return Err(RecordError::HeaderCrcMismatch { expected, actual });
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().expect("slice length checked"));
        if version != FORMAT_VERSION {
            // A foreign version is reported but does not abort decoding:
            // later records may still be readable.
            warn!(version, "record format version differs from current");
        }

        Ok(Self {
            version,
            flags: u16::from_le_bytes(buf[6..8].try_into().expect("slice length checked")),
            payload_len: u32::from_le_bytes(buf[8..12].try_into().expect("slice length checked")),
            timestamp_ns: i64::from_le_bytes(buf[12..20].try_into().expect("slice length checked")),
            header_crc: expected,
        })
    }

    /// Full on-disk size of the record this header begins.
    pub fn record_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload_len as usize
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// One persisted event, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u16,
    pub flags: u16,
    pub timestamp_ns: i64,
    pub sequence: u64,
    pub prev_hash: [u8; HASH_SIZE],
    pub payload: Vec<u8>,
}

impl Record {
    /// Builds a current-version record with no flags set.
    pub fn new(
        sequence: u64,
        prev_hash: [u8; HASH_SIZE],
        timestamp_ns: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            flags: 0,
            timestamp_ns,
            sequence,
            prev_hash,
            payload,
        }
    }

    /// Returns `true` when the DELETED flag is set.
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// Returns `true` when the COMPACTED flag is set.
    pub fn is_compacted(&self) -> bool {
        self.flags & FLAG_COMPACTED != 0
    }

    /// Total on-disk size of this record once encoded.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }

    /// Serializes the record to its exact on-disk byte sequence.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Serializes into a caller-provided buffer, appending to it.
    ///
    /// The writer's hot path reuses one scratch buffer across appends.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.reserve(self.encoded_len());

        buf.extend_from_slice(&MAGIC_HEADER.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());

        let header_crc = crc32fast::hash(&buf[start..start + 20]);
        buf.extend_from_slice(&header_crc.to_le_bytes());

        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.payload);

        let data_crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&data_crc.to_le_bytes());
        buf.extend_from_slice(&MAGIC_FOOTER.to_le_bytes());
    }

    /// Decodes one record from the front of `buf` with the default
    /// payload limit. Returns the record and its encoded length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RecordError> {
        Self::decode_with_limit(buf, DEFAULT_MAX_PAYLOAD)
    }

    /// Decodes one record from the front of `buf`, validating both
    /// magics and both CRCs. `max_payload` bounds the declared payload
    /// length before any allocation happens.
    pub fn decode_with_limit(buf: &[u8], max_payload: u32) -> Result<(Self, usize), RecordError> {
        let header = RecordHeader::decode(buf)?;

        if header.payload_len > max_payload {
            return Err(RecordError::LengthOverflow {
                len: header.payload_len,
                max: max_payload,
            });
        }

        let total = header.record_len();
        if buf.len() < total {
            return Err(RecordError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let data_end = PREFIX_SIZE + header.payload_len as usize;
        let expected =
            u32::from_le_bytes(buf[data_end..data_end + 4].try_into().expect("bounds checked"));
        let actual = crc32fast::hash(&buf[0..data_end]);
        if actual != expected {
            return Err(RecordError::DataCrcMismatch { expected, actual });
        }

        let footer = u32::from_le_bytes(
            buf[data_end + 4..data_end + 8]
                .try_into()
                .expect("bounds checked"),
        );
        if footer != MAGIC_FOOTER {
            return Err(RecordError::BadFooter { found: footer });
        }

        let record = Self {
            version: header.version,
            flags: header.flags,
            timestamp_ns: header.timestamp_ns,
            sequence: u64::from_le_bytes(buf[24..32].try_into().expect("bounds checked")),
            prev_hash: buf[32..64].try_into().expect("bounds checked"),
            payload: buf[PREFIX_SIZE..data_end].to_vec(),
        };

        Ok((record, total))
    }

    /// Decodes one record without CRC verification.
    ///
    /// Magics and length bounds are still enforced. Recovery-only: the
    /// shadow-file pass accepts bit rot a strict decode would reject,
    /// and reports every such acceptance.
    pub fn decode_relaxed(buf: &[u8], max_payload: u32) -> Result<(Self, usize), RecordError> {
        if buf.len() < HEADER_SIZE {
            return Err(RecordError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("bounds checked"));
        if magic != MAGIC_HEADER {
            return Err(RecordError::BadMagic { found: magic });
        }

        let payload_len = u32::from_le_bytes(buf[8..12].try_into().expect("bounds checked"));
        if payload_len > max_payload {
            return Err(RecordError::LengthOverflow {
                len: payload_len,
                max: max_payload,
            });
        }

        let total = RECORD_OVERHEAD + payload_len as usize;
        if buf.len() < total {
            return Err(RecordError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let data_end = PREFIX_SIZE + payload_len as usize;
        let footer = u32::from_le_bytes(
            buf[data_end + 4..data_end + 8]
                .try_into()
                .expect("bounds checked"),
        );
        if footer != MAGIC_FOOTER {
            return Err(RecordError::BadFooter { found: footer });
        }

        Ok((
            Self {
                version: u16::from_le_bytes(buf[4..6].try_into().expect("bounds checked")),
                flags: u16::from_le_bytes(buf[6..8].try_into().expect("bounds checked")),
                timestamp_ns: i64::from_le_bytes(buf[12..20].try_into().expect("bounds checked")),
                sequence: u64::from_le_bytes(buf[24..32].try_into().expect("bounds checked")),
                prev_hash: buf[32..64].try_into().expect("bounds checked"),
                payload: buf[PREFIX_SIZE..data_end].to_vec(),
            },
            total,
        ))
    }

    /// SHA-256 of this record's serialized bytes — the value the next
    /// record in the chain must carry as `prev_hash`.
    pub fn hash(&self) -> [u8; HASH_SIZE] {
        hash_bytes(&self.encode())
    }
}

/// SHA-256 over already-serialized record bytes.
///
/// The writer uses this to chain without re-encoding the record it just
/// wrote.
pub fn hash_bytes(bytes: &[u8]) -> [u8; HASH_SIZE] {
    let digest = Sha256::digest(bytes);
    digest.into()
}
