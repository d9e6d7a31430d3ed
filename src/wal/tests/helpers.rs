use crate::event::{AuditEvent, Level};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A minimal info-level event with the given message.
pub fn event(message: &str) -> AuditEvent {
    AuditEvent::new(Level::Info, message)
}

/// Extracts the `message` property from a JSON payload.
pub fn message_of(payload: &[u8]) -> String {
    let value: serde_json::Value = serde_json::from_slice(payload).expect("payload is JSON");
    value["message"].as_str().unwrap_or_default().to_string()
}
