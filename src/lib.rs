//! # chainwal
//!
//! An embeddable, crash-safe, append-only audit log engine built on a
//! durable, hash-chained write-ahead log. Designed for workloads where
//! losing a record is not an option: every append is journalled before
//! it touches the main file, every record carries two CRCs and the
//! SHA-256 of its predecessor, and recovery can read through corruption
//! that would stop an ordinary log cold.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Wal (writer)                     │
//! │   append ──► record codec ──► journal ──► active file   │
//! │                  │                            │         │
//! │                  │ rotate-if-full             │ fsync   │
//! │                  ▼                            ▼         │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │ SegmentManager: audit.wal, audit-…wal (sealed),  │   │
//! │  │ compacted-…wal — discovery / rotation / pruning  │   │
//! │  └──────────────────────────────────────────────────┘   │
//! │        ▲                 ▲                  ▲           │
//! │  SegmentReader        WalIndex          Compactor       │
//! │  (scan, ranges)    (seq/time lookup)  (merge, archive)  │
//! │                                                         │
//! │  RecoveryEngine — resync, forensics, repair             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`wal`] | Single-writer engine — durability modes, rotation, integrity verification |
//! | [`record`] | Binary record codec with CRCs, magics, and the SHA-256 hash chain |
//! | [`segment`] | Segment discovery, rotation naming, sealing, pruning |
//! | [`journal`] | Double-write journal for torn-write protection |
//! | [`reader`] | Sequential per-segment reads and time-range queries |
//! | [`recovery`] | Standard and forensic corruption recovery, repair |
//! | [`index`] | Persistent sequence → location and time-range lookup |
//! | [`compactor`] | Tombstone-aware segment merging with archive retention |
//! | [`checksum`] | Interchangeable checksum algorithms and variants |
//! | [`event`] | The structured event type accepted at the boundary |
//!
//! ## Guarantees
//!
//! - **No silent loss** — an append only returns once the record is in
//!   the fsynced journal; a crash at any instant leaves it recoverable.
//! - **Tamper evidence** — each record chains to the SHA-256 of its
//!   predecessor's bytes; any rewrite of history is visible to
//!   [`wal::Wal::verify_integrity`].
//! - **Ordered** — sequences are strictly monotonic and match on-disk
//!   order, within and across segments.
//! - **Recoverable** — corruption loses at most the damaged records;
//!   everything decodable around it is salvaged.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainwal::event::{AuditEvent, Level};
//! use chainwal::wal::{Wal, WalOptions};
//!
//! let wal = Wal::open("/var/log/app/audit.wal", WalOptions::default()).unwrap();
//!
//! let event = AuditEvent::new(Level::Info, "user logged in")
//!     .with_property("user", serde_json::json!("alice"));
//! let sequence = wal.append(&event).unwrap();
//! assert_eq!(sequence, 1);
//!
//! let report = wal.verify_integrity().unwrap();
//! assert!(report.valid);
//!
//! wal.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod checksum;
pub mod compactor;
pub mod event;
pub mod index;
pub mod journal;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod wal;
