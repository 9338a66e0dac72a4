use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::event;

pub const CONNECT_ACCEPTED: &str = "connect_accepted";
pub const CONNECT_REJECTED: &str = "connect_rejected";
pub const SESSION_TAKEN_OVER: &str = "session_taken_over";
pub const PUBLISH_DENIED: &str = "publish_denied";
pub const SUBSCRIBE_DENIED: &str = "subscribe_denied";
pub const WILL_PUBLISHED: &str = "will_published";
pub const SESSION_REMOVED: &str = "session_removed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_type: String,
    pub partition: String,
    pub client_id: String,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct AuditSink {
    inner: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        self.inner.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

/// Retain audit events in process; only the first installed sink is kept.
pub fn install_sink(sink: AuditSink) {
    let _ = AUDIT_SINK.set(sink);
}

/// Copy of the retained audit events.
pub fn snapshot() -> Vec<AuditEvent> {
    AUDIT_SINK
        .get()
        .map(|s| s.inner.lock().clone())
        .unwrap_or_default()
}

/// Emit an immutable audit event on the `audit` target.
pub fn emit(event_type: &str, partition: &str, client_id: &str, message: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        %partition,
        %client_id,
        %message
    );
    if let Some(sink) = AUDIT_SINK.get() {
        sink.record(AuditEvent {
            event_type: event_type.to_string(),
            partition: partition.to_string(),
            client_id: client_id.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_sink_retains_events() {
        install_sink(AuditSink::default());
        emit(SESSION_REMOVED, "p-audit", "dev-audit", "clean disconnect");
        let events = snapshot();
        assert!(events.iter().any(|e| e.event_type == SESSION_REMOVED
            && e.partition == "p-audit"
            && e.client_id == "dev-audit"));
    }
}
