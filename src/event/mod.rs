//! # Audit Events
//!
//! The event type accepted at the engine boundary. An [`AuditEvent`] is a
//! structured log record — timestamp, severity, message, free-form
//! properties, optional exception text — serialized to self-describing
//! JSON before it enters the log. Everything below this boundary treats
//! the payload as opaque bytes; masking, signing, or encryption belongs
//! to the caller and must happen before [`crate::wal::Wal::append`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned when converting events to or from payload bytes.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload is not valid JSON or does not describe an event.
    #[error("Payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

/// One structured event as delivered by the caller.
///
/// `timestamp_ns` is nanoseconds since the Unix epoch; it is carried both
/// here (inside the JSON payload) and in the record header, so recovery
/// can restore event time even when only one of the two survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event time in nanoseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ns: i64,

    /// Severity level.
    pub level: Level,

    /// Human-readable message (may be a template with `{placeholders}`
    /// resolved against `properties` by the caller's logging framework).
    pub message: String,

    /// Structured properties attached to the event.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,

    /// Rendered exception / backtrace text, when the event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl AuditEvent {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp_ns: now_ns(),
            level,
            message: message.into(),
            properties: serde_json::Map::new(),
            exception: None,
        }
    }

    /// Attaches one property, builder-style.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Serializes the event to its on-disk JSON payload.
    pub fn to_payload(&self) -> Vec<u8> {
        // A struct of these field types cannot fail JSON serialization.
        serde_json::to_vec(self).expect("event serialization is infallible")
    }

    /// Parses an event back from payload bytes.
    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
