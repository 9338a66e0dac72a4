//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building a broker over the in-memory store and a recording sink
//! - Constructing client messages
//! - Driving CONNECT and picking replies out of the sink

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera::auth::StaticIdentity;
use tessera::broker::{Broker, BrokerError, BrokerSettings, RecordingSink};
use tessera::config::Config;
use tessera::mqtt::{
    Connect, ConnectAck, ConnectReturnCode, Header, Message, MessageId, Packet, Publish, Qos,
    Subscribe, SubscriptionKey, TopicRequest, Will,
};
use tessera::store::{
    ClientRecord, Direction, InFlightRecord, MemoryStore, SessionStore, StoreError, StoreResult,
    Subscriber, SubscriptionRecord,
};

pub const CONFIG: &str = r#"
[node]
node_id = "node-a"
cluster = "local"

[partitions]
default_partition = "p0"

[identity]
allow_anonymous = true
anonymous_permissions = ["SUBSCRIBE:public/#"]

[[identity.accounts]]
partition = "p1"
username = "dev1"
password = "secret"
permissions = ["PUBLISH:sensors/#", "SUBSCRIBE:sensors/#", "PUBLISH:%p/%c/#", "SUBSCRIBE:%p/%c/#"]

[[identity.accounts]]
partition = "p1"
username = "dev2"
password = "secret"
permissions = ["PUBLISH:sensors/#", "SUBSCRIBE:sensors/#", "SUBSCRIBE:status/#"]

[[identity.accounts]]
partition = "p2"
username = "dev1"
password = "secret"
permissions = ["PUBLISH:#", "SUBSCRIBE:#"]
"#;

pub struct Harness {
    pub broker: Broker,
    pub store: Arc<MemoryStore>,
    pub sink: RecordingSink,
}

pub fn config() -> Config {
    toml::from_str(CONFIG).expect("test config")
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(cfg: Config) -> Harness {
    cfg.validate().expect("valid test config");
    let store = Arc::new(MemoryStore::new());
    let sink = RecordingSink::new();
    let broker = Broker::new(
        BrokerSettings::from_config(&cfg).expect("settings"),
        store.clone(),
        Arc::new(StaticIdentity::from_config(&cfg.identity)),
        Arc::new(sink.clone()),
    );
    Harness {
        broker,
        store,
        sink,
    }
}

/// Harness whose broker talks to the memory store through [`FlakyStore`].
pub fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let cfg = config();
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let sink = RecordingSink::new();
    let broker = Broker::new(
        BrokerSettings::from_config(&cfg).expect("settings"),
        flaky.clone(),
        Arc::new(StaticIdentity::from_config(&cfg.identity)),
        Arc::new(sink.clone()),
    );
    (
        Harness {
            broker,
            store,
            sink,
        },
        flaky,
    )
}

/// Memory store whose subscriber query can be made to fail once.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_distribute: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_distribute: AtomicBool::new(false),
        }
    }

    /// The next `distribute_publish` yields `StoreError::Unavailable`.
    pub fn fail_next_distribute(&self) {
        self.fail_distribute.store(true, Ordering::SeqCst);
    }
}

impl SessionStore for FlakyStore {
    fn get_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<ClientRecord>>> {
        self.inner.get_client(partition, client_id)
    }

    fn save_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.save_client(record)
    }

    fn remove_client<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.remove_client(partition, client_id)
    }

    fn get_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Will>>> {
        self.inner.get_will(partition, client_id)
    }

    fn save_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        will: &'a Will,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.save_will(partition, client_id, will)
    }

    fn remove_will<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.remove_will(partition, client_id)
    }

    fn get_subscription<'a>(
        &'a self,
        key: &'a SubscriptionKey,
    ) -> BoxFuture<'a, StoreResult<Option<SubscriptionRecord>>> {
        self.inner.get_subscription(key)
    }

    fn save_subscription<'a>(
        &'a self,
        record: &'a SubscriptionRecord,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.save_subscription(record)
    }

    fn remove_subscription<'a>(
        &'a self,
        key: &'a SubscriptionKey,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.remove_subscription(key)
    }

    fn distribute_publish<'a>(
        &'a self,
        candidates: &'a [SubscriptionKey],
        publish: &'a Message,
    ) -> BoxStream<'a, StoreResult<Subscriber>> {
        if self.fail_distribute.swap(false, Ordering::SeqCst) {
            return stream::iter(vec![Err(StoreError::Unavailable("blip".into()))]).boxed();
        }
        self.inner.distribute_publish(candidates, publish)
    }

    fn get_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<Option<InFlightRecord>>> {
        self.inner
            .get_in_flight(partition, client_id, message_id, direction)
    }

    fn save_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        record: InFlightRecord,
    ) -> BoxFuture<'a, StoreResult<u16>> {
        self.inner.save_in_flight(partition, client_id, record)
    }

    fn remove_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
        message_id: u16,
        direction: Direction,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner
            .remove_in_flight(partition, client_id, message_id, direction)
    }

    fn get_all_in_flight<'a>(
        &'a self,
        partition: &'a str,
        client_id: &'a str,
    ) -> BoxStream<'a, StoreResult<InFlightRecord>> {
        self.inner.get_all_in_flight(partition, client_id)
    }

    fn next_client_id(&self) -> BoxFuture<'_, StoreResult<String>> {
        self.inner.next_client_id()
    }
}

pub fn connect(client_id: &str, username: Option<&str>, clean_session: bool) -> Message {
    Message::new(
        Header::default(),
        Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            client_id: client_id.into(),
            clean_session,
            keep_alive: 30,
            username: username.map(str::to_string),
            password: username.map(|_| Bytes::from_static(b"secret")),
            will: None,
            protocol_data: None,
        }),
    )
}

pub fn with_will(mut message: Message, topic: &str, qos: Qos) -> Message {
    if let Packet::Connect(connect) = &mut message.packet {
        connect.will = Some(Will {
            topic: topic.into(),
            payload: Bytes::from_static(b"gone"),
            qos,
            retain: false,
        });
    }
    message
}

pub fn publish(topic: &str, qos: Qos, id: Option<u16>) -> Message {
    Message::new(
        Header {
            message_id: id.map(MessageId::Packet),
            qos,
            dup: false,
            retain: false,
        },
        Packet::Publish(Publish {
            topic: topic.into(),
            payload: Bytes::from_static(b"21.5"),
        }),
    )
}

pub fn subscribe(id: u16, filters: &[(&str, Qos)]) -> Message {
    Message::new(
        Header::with_id(id),
        Packet::Subscribe(Subscribe {
            topics: filters
                .iter()
                .map(|(filter, qos)| TopicRequest {
                    filter: (*filter).into(),
                    qos: *qos,
                })
                .collect(),
            protocol_data: None,
        }),
    )
}

pub fn ack(packet: Packet, id: u16) -> Message {
    Message::ack(packet, id)
}

/// Outcome of a CONNECT: the CONNACK plus everything else pushed with it.
pub struct Opened {
    pub outcome: Result<(), BrokerError>,
    pub session_id: String,
    pub ack: ConnectAck,
    pub pushed: Vec<Message>,
}

impl Harness {
    /// CONNECT on `connection_id`, draining the sink.
    pub async fn open(&self, connection_id: &str, connect: Message) -> Opened {
        let outcome = self.broker.on_message(connection_id, None, connect).await;
        let mut pushed = self.sink.take();
        let position = pushed
            .iter()
            .position(|m| {
                matches!(m.packet, Packet::ConnectAck(_)) && m.route.connection_id == connection_id
            })
            .expect("connack pushed");
        let connack = pushed.remove(position);
        let Packet::ConnectAck(ack) = connack.packet else {
            unreachable!()
        };
        Opened {
            outcome,
            session_id: connack.route.session_id,
            ack,
            pushed,
        }
    }

    /// CONNECT that must be accepted; returns the session id.
    pub async fn login(&self, connection_id: &str, connect: Message) -> String {
        let opened = self.open(connection_id, connect).await;
        assert!(opened.outcome.is_ok(), "connect failed: {:?}", opened.outcome);
        assert_eq!(opened.ack.code, ConnectReturnCode::Accepted);
        opened.session_id
    }

    pub async fn send(
        &self,
        connection_id: &str,
        session_id: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.broker
            .on_message(connection_id, Some(session_id), message)
            .await
    }

    /// Drain the sink, keeping what was pushed to `client_id`.
    pub fn pushed_to(&self, client_id: &str) -> Vec<Message> {
        self.sink
            .take()
            .into_iter()
            .filter(|m| m.route.client_id == client_id)
            .collect()
    }
}
