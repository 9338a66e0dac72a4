use crate::mqtt::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("no route to connection {0}")]
    NoRoute(String),
    #[error("connection {0} is closed")]
    Closed(String),
}

/// Core-to-transport push.
///
/// Best effort and non-blocking. A `Disconnect` message asks the transport to
/// close the connection named in its route.
pub trait Outbound: Send + Sync {
    fn push(&self, cluster: &str, node_id: &str, message: Message) -> Result<(), SinkError>;
}

/// Sink that keeps every pushed message, for tests and tooling.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pushed: Arc<Mutex<Vec<Message>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.pushed.lock())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.pushed.lock().clone()
    }
}

impl Outbound for RecordingSink {
    fn push(&self, _cluster: &str, _node_id: &str, message: Message) -> Result<(), SinkError> {
        self.pushed.lock().push(message);
        Ok(())
    }
}
