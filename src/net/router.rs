//! Delivery of engine output to live connections on this node.

use crate::broker::{Outbound, SinkError};
use crate::mqtt::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Routes pushed messages to the writer of the connection named in their route.
pub struct ConnectionRouter {
    node_id: String,
    cluster: String,
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl ConnectionRouter {
    pub fn new(node_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cluster: cluster.into(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a connection; its outbound messages arrive on the returned receiver.
    pub fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().insert(connection_id.to_string(), tx);
        rx
    }

    pub fn deregister(&self, connection_id: &str) {
        self.connections.lock().remove(connection_id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Outbound for ConnectionRouter {
    fn push(&self, cluster: &str, node_id: &str, message: Message) -> Result<(), SinkError> {
        let connection_id = message.route.connection_id.clone();
        if cluster != self.cluster || node_id != self.node_id {
            debug!(
                "no forwarding to remote node cluster={} node_id={} connection_id={}",
                cluster, node_id, connection_id
            );
            return Err(SinkError::NoRoute(connection_id));
        }
        let guard = self.connections.lock();
        let Some(tx) = guard.get(&connection_id) else {
            return Err(SinkError::NoRoute(connection_id));
        };
        tx.send(message)
            .map_err(|_| SinkError::Closed(connection_id))
    }
}
