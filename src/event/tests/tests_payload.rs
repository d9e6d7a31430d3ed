//! Event ↔ payload round-trips and JSON shape guarantees.

#[cfg(test)]
mod tests {
    use crate::event::{AuditEvent, Level};
    use serde_json::json;

    #[test]
    fn payload_round_trip_preserves_event() {
        let event = AuditEvent::new(Level::Info, "user {user} logged in")
            .with_property("user", json!("alice"))
            .with_property("entity_id", json!("acct-42"));

        let payload = event.to_payload();
        let decoded = AuditEvent::from_payload(&payload).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn payload_is_self_describing_json() {
        let event = AuditEvent::new(Level::Warning, "disk almost full");
        let value: serde_json::Value = serde_json::from_slice(&event.to_payload()).unwrap();

        assert_eq!(value["level"], json!("warning"));
        assert_eq!(value["message"], json!("disk almost full"));
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn empty_properties_are_omitted() {
        let event = AuditEvent::new(Level::Debug, "terse");
        let value: serde_json::Value = serde_json::from_slice(&event.to_payload()).unwrap();
        assert!(value.get("properties").is_none());
        assert!(value.get("exception").is_none());
    }

    #[test]
    fn exception_survives_round_trip() {
        let mut event = AuditEvent::new(Level::Error, "operation failed");
        event.exception = Some("io error: permission denied".into());

        let decoded = AuditEvent::from_payload(&event.to_payload()).unwrap();
        assert_eq!(
            decoded.exception.as_deref(),
            Some("io error: permission denied")
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(AuditEvent::from_payload(b"{\"level\":").is_err());
        assert!(AuditEvent::from_payload(b"not json at all").is_err());
    }
}
