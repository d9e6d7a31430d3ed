//! # Checksum Primitives
//!
//! Interchangeable hash algorithms used to protect every on-disk byte of
//! the log. All algorithms implement the [`Checksum`] trait so callers
//! (record codec, journal, index snapshot, verification passes) can be
//! configured with any of them without caring about the concrete
//! implementation.
//!
//! ## Algorithms
//!
//! | Algorithm | Crate | Notes |
//! |-----------|-------|-------|
//! | [`Crc32`] | `crc32fast` | CRC32-IEEE, the record format default |
//! | [`Crc32c`] | `crc32c` | Castagnoli polynomial, HW-accelerated where available |
//! | [`Crc64`] | `crc` | CRC64-ISO |
//! | [`XxHash64`] | `xxhash-rust` | non-cryptographic, fastest in software |
//!
//! ## Composite variants
//!
//! - [`CompositeChecksum`] — folds two algorithms into one 64-bit value
//!   (high 32 bits from the primary, low 32 bits from the secondary) for
//!   defence in depth against single-algorithm blind spots.
//! - [`BlockChecksum`] — splits input into fixed-size blocks and produces
//!   one checksum per block, so verification can localise the first
//!   corrupted block instead of rejecting the whole buffer.
//! - [`RollingChecksum`] — fixed window over a byte stream with O(1)
//!   per-byte updates for the XXHash-backed mode.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::VecDeque;

use crc::{CRC_64_GO_ISO, Crc};
use crc32fast::Hasher as Crc32Hasher;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// CRC64-ISO instance shared by all [`Crc64`] values.
const CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Modulus of the Adler-style rolling composition.
const ADLER_MOD: u64 = 65_521;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by checksum verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChecksumError {
    /// Computed value did not match the expected one.
    #[error("{algorithm} checksum mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch {
        /// Name of the algorithm that failed.
        algorithm: &'static str,
        /// Value stored alongside the data.
        expected: u64,
        /// Value recomputed from the data.
        actual: u64,
    },

    /// Block checksum count does not match the number of data blocks.
    #[error("block count mismatch: {expected} checksums for {actual} blocks")]
    BlockCountMismatch { expected: usize, actual: usize },
}

// ------------------------------------------------------------------------------------------------
// Checksum trait
// ------------------------------------------------------------------------------------------------

/// A uniform interface over checksum algorithms.
///
/// Results are widened to `u64`; 32-bit algorithms return their value in
/// the low 32 bits.
pub trait Checksum: Send + Sync {
    /// Computes the checksum of `data`.
    fn calculate(&self, data: &[u8]) -> u64;

    /// Returns `true` when the checksum of `data` equals `expected`.
    fn verify(&self, data: &[u8], expected: u64) -> bool {
        self.calculate(data) == expected
    }

    /// Short algorithm name used in error messages and reports.
    fn name(&self) -> &'static str;

    /// Verifies and converts a mismatch into a structured error.
    fn check(&self, data: &[u8], expected: u64) -> Result<(), ChecksumError> {
        let actual = self.calculate(data);
        if actual != expected {
            return Err(ChecksumError::ChecksumMismatch {
                algorithm: self.name(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Algorithm — config-level selector
// ------------------------------------------------------------------------------------------------

/// Selects a concrete checksum algorithm at configuration level.
///
/// Used wherever a checksum choice is part of configuration rather than
/// wired statically (rolling windows, verification passes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// CRC32-IEEE (`crc32fast`).
    Crc32,
    /// CRC32-Castagnoli (`crc32c`), hardware-accelerated where available.
    Crc32c,
    /// CRC64-ISO.
    Crc64,
    /// XXHash64 with seed 0.
    XxHash64,
}

impl Algorithm {
    /// Returns the implementation behind this selector.
    pub fn hasher(&self) -> Box<dyn Checksum> {
        match self {
            Self::Crc32 => Box::new(Crc32),
            Self::Crc32c => Box::new(Crc32c),
            Self::Crc64 => Box::new(Crc64),
            Self::XxHash64 => Box::new(XxHash64),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Leaf algorithms
// ------------------------------------------------------------------------------------------------

/// CRC32-IEEE — the polynomial used by the record format itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    fn calculate(&self, data: &[u8]) -> u64 {
        let mut hasher = Crc32Hasher::new();
        hasher.update(data);
        u64::from(hasher.finalize())
    }

    fn name(&self) -> &'static str {
        "crc32"
    }
}

/// CRC32-Castagnoli. Dispatches to SSE4.2 / ARMv8 CRC instructions when
/// the host supports them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32c;

impl Checksum for Crc32c {
    fn calculate(&self, data: &[u8]) -> u64 {
        u64::from(crc32c::crc32c(data))
    }

    fn name(&self) -> &'static str {
        "crc32c"
    }
}

/// CRC64-ISO.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc64;

impl Checksum for Crc64 {
    fn calculate(&self, data: &[u8]) -> u64 {
        CRC64_ISO.checksum(data)
    }

    fn name(&self) -> &'static str {
        "crc64"
    }
}

/// XXHash64 with a fixed zero seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash64;

impl Checksum for XxHash64 {
    fn calculate(&self, data: &[u8]) -> u64 {
        xxh64(data, 0)
    }

    fn name(&self) -> &'static str {
        "xxhash64"
    }
}

// ------------------------------------------------------------------------------------------------
// CompositeChecksum
// ------------------------------------------------------------------------------------------------

/// Two algorithms folded into a single 64-bit value.
///
/// The high 32 bits carry the primary algorithm's low 32 bits, the low
/// 32 bits carry the secondary's. A corruption pattern that collides on
/// one polynomial must also collide on the other to go unnoticed.
pub struct CompositeChecksum {
    primary: Box<dyn Checksum>,
    secondary: Box<dyn Checksum>,
}

impl CompositeChecksum {
    pub fn new(primary: Box<dyn Checksum>, secondary: Box<dyn Checksum>) -> Self {
        Self { primary, secondary }
    }

    /// Composite of the two record-format defaults: CRC32 over XXHash64.
    pub fn default_pair() -> Self {
        Self::new(Box::new(Crc32), Box::new(XxHash64))
    }
}

impl Checksum for CompositeChecksum {
    fn calculate(&self, data: &[u8]) -> u64 {
        let high = self.primary.calculate(data) & 0xFFFF_FFFF;
        let low = self.secondary.calculate(data) & 0xFFFF_FFFF;
        (high << 32) | low
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

// ------------------------------------------------------------------------------------------------
// BlockChecksum
// ------------------------------------------------------------------------------------------------

/// Per-block checksums over fixed-size chunks of a buffer.
///
/// The final block may be shorter than `block_size`. Verification
/// reports the index of the **first** mismatching block so corruption
/// can be localised without re-reading the whole input.
pub struct BlockChecksum {
    algorithm: Box<dyn Checksum>,
    block_size: usize,
}

impl BlockChecksum {
    /// Creates a block checksum with the given algorithm and block size.
    ///
    /// `block_size` must be non-zero.
    pub fn new(algorithm: Box<dyn Checksum>, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            algorithm,
            block_size,
        }
    }

    /// Computes one checksum per `block_size` chunk of `data`.
    pub fn checksum_blocks(&self, data: &[u8]) -> Vec<u64> {
        data.chunks(self.block_size)
            .map(|block| self.algorithm.calculate(block))
            .collect()
    }

    /// Verifies `data` against previously computed block checksums.
    ///
    /// Returns `None` when every block matches, or `Some(index)` of the
    /// first mismatching block. A length mismatch between data blocks
    /// and `expected` counts as a mismatch at the first divergent index.
    pub fn verify_blocks(&self, data: &[u8], expected: &[u64]) -> Option<usize> {
        let mut blocks = data.chunks(self.block_size);

        for (idx, want) in expected.iter().enumerate() {
            match blocks.next() {
                Some(block) if self.algorithm.calculate(block) == *want => {}
                _ => return Some(idx),
            }
        }

        // Trailing data blocks with no expected checksum are a mismatch
        // at the first uncovered index.
        if blocks.next().is_some() {
            return Some(expected.len());
        }

        None
    }
}

// ------------------------------------------------------------------------------------------------
// RollingChecksum
// ------------------------------------------------------------------------------------------------

/// Fixed-window checksum over a byte stream.
///
/// For [`Algorithm::XxHash64`] the window value is maintained with an
/// Adler-style two-component sum, giving O(1) per-byte updates. CRC
/// variants recompute over the buffered window on each update — correct
/// for every algorithm, linear in the window size.
pub struct RollingChecksum {
    algorithm: Algorithm,
    window_size: usize,
    window: VecDeque<u8>,

    // Adler-style components, maintained only in XxHash64 mode.
    a: u64,
    b: u64,
}

impl RollingChecksum {
    /// Creates an empty rolling window. `window_size` must be non-zero.
    pub fn new(algorithm: Algorithm, window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be non-zero");
        Self {
            algorithm,
            window_size,
            window: VecDeque::with_capacity(window_size),
            a: 1,
            b: 0,
        }
    }

    /// Pushes one byte into the window, evicting the oldest byte once
    /// the window is full. Returns the checksum of the current window.
    pub fn push(&mut self, byte: u8) -> u64 {
        let evicted = if self.window.len() == self.window_size {
            self.window.pop_front()
        } else {
            None
        };
        self.window.push_back(byte);

        if self.algorithm == Algorithm::XxHash64 {
            match evicted {
                // Steady state: standard rolling update over a full
                // window of `window_size` bytes.
                Some(old) => {
                    let n = self.window_size as u64 % ADLER_MOD;
                    let old = u64::from(old);
                    let new = u64::from(byte);
                    self.a = (self.a + ADLER_MOD + new - old) % ADLER_MOD;
                    self.b = (self.b + (n + 1) * ADLER_MOD + self.a - (n * old) % ADLER_MOD - 1)
                        % ADLER_MOD;
                }
                // Filling phase: plain accumulation.
                None => {
                    self.a = (self.a + u64::from(byte)) % ADLER_MOD;
                    self.b = (self.b + self.a) % ADLER_MOD;
                }
            }
        }

        self.value()
    }

    /// Checksum of the bytes currently in the window.
    pub fn value(&self) -> u64 {
        match self.algorithm {
            Algorithm::XxHash64 => (self.b << 32) | self.a,
            _ => {
                let (front, back) = self.window.as_slices();
                let mut buf = Vec::with_capacity(self.window.len());
                buf.extend_from_slice(front);
                buf.extend_from_slice(back);
                self.algorithm.hasher().calculate(&buf)
            }
        }
    }

    /// Number of bytes currently buffered (≤ window size).
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` when no bytes have been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
