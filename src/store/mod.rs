//! Persistence contract for client, will, subscription and in-flight records.
//!
//! The broker engine is the only caller. Lookups report a missing record as
//! `Ok(None)`; errors are reserved for backend failures.

pub mod locks;
pub mod memory;

use crate::mqtt::{Header, Message, MessageId, ProtocolVersion, SubscriptionKey, Will};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::BTreeSet;
use thiserror::Error;

pub use locks::KeyLocks;
pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("no free message id for {partition}/{client_id}")]
    Exhausted {
        partition: String,
        client_id: String,
    },
}

impl StoreError {
    /// Whether re-issuing the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

/// Handshake direction of a stored in-flight publish, seen from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Received from the client; the broker is the receiver.
    Inbound,
    /// Sent to the client; the broker is the sender.
    Outbound,
}

/// Session record of one client in one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub partition: String,
    pub client_id: String,
    pub session_id: String,
    pub connected_cluster: String,
    pub connected_node: String,
    pub connection_id: String,
    pub active: bool,
    pub clean_session: bool,
    pub protocol: ProtocolVersion,
    /// Delivery address for transports without a persistent connection.
    pub protocol_data: Option<String>,
    pub subscriptions: BTreeSet<SubscriptionKey>,
}

impl ClientRecord {
    pub fn new(partition: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            client_id: client_id.into(),
            session_id: String::new(),
            connected_cluster: String::new(),
            connected_node: String::new(),
            connection_id: String::new(),
            active: false,
            clean_session: true,
            protocol: ProtocolVersion::V3_1_1,
            protocol_data: None,
            subscriptions: BTreeSet::new(),
        }
    }
}

/// Subscriber set of one `partition/qos/filter` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub key: SubscriptionKey,
    pub clients: BTreeSet<String>,
}

impl SubscriptionRecord {
    pub fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            clients: BTreeSet::new(),
        }
    }
}

/// Publish whose QoS 1/2 handshake has not completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRecord {
    pub direction: Direction,
    pub message: Message,
    /// QoS 2 only: inbound PUBREL processed, or outbound PUBREC received.
    pub released: bool,
}

impl InFlightRecord {
    pub fn new(direction: Direction, message: Message) -> Self {
        Self {
            direction,
            message,
            released: false,
        }
    }

    pub fn message_id(&self) -> Option<u16> {
        self.message.header.packet_id()
    }

    pub fn header(&self) -> &Header {
        &self.message.header
    }
}

/// Client subscribed through one of the candidate keys of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub key: SubscriptionKey,
    pub client_id: String,
}

pub trait SessionStore: Send + Sync {
    fn get_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<ClientRecord>>>;

    fn save_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, StoreResult<()>>;

    fn remove_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn get_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Will>>>;

    fn save_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        will: &'a Will,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn remove_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn get_subscription<'a>(
        &'a self,
        key: &'a SubscriptionKey,
    ) -> BoxFuture<'a, StoreResult<Option<SubscriptionRecord>>>;

    fn save_subscription<'a>(
        &'a self,
        record: &'a SubscriptionRecord,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn remove_subscription<'a>(&'a self, key: &'a SubscriptionKey)
        -> BoxFuture<'a, StoreResult<()>>;

    /// Every subscriber of any candidate key.
    fn distribute_publish<'a>(
        &'a self,
        candidates: &'a [SubscriptionKey],
        publish: &'a Message,
    ) -> BoxStream<'a, StoreResult<Subscriber>>;

    fn get_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<Option<InFlightRecord>>>;

    /// Upsert an in-flight record and return its message id.
    ///
    /// A record carrying [`MessageId::AssignOnPersist`] is given a fresh id
    /// unused by the client's other records in the same direction.
    fn save_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        record: InFlightRecord,
    ) -> BoxFuture<'a, StoreResult<u16>>;

    fn remove_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn get_all_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxStream<'a, StoreResult<InFlightRecord>>;

    /// Sequence value used to build broker-assigned client ids.
    fn next_client_id(&self) -> BoxFuture<'_, StoreResult<String>>;
}

/// Whether `id` needs the store to assign a fresh packet id.
pub(crate) fn needs_assignment(id: Option<MessageId>) -> bool {
    matches!(id, None | Some(MessageId::AssignOnPersist) | Some(MessageId::Will))
}
