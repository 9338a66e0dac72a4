//! Structured control messages exchanged between the transport and the engine.
//!
//! Every message carries a fixed header (`qos`, `dup`, `retain`, optional
//! message id) and the routing metadata the session layer attaches. The body is
//! a closed enum over the MQTT 3.1/3.1.1 control operations handled by the
//! broker.

use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub const ALL: [Qos; 3] = [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
}

impl ProtocolVersion {
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V3_1 => 3,
            ProtocolVersion::V3_1_1 => 4,
        }
    }

    /// Resolve the protocol from the CONNECT name/level pair.
    pub fn negotiate(name: &str, level: u8) -> Option<Self> {
        match (name, level) {
            ("MQIsdp", 3) => Some(ProtocolVersion::V3_1),
            ("MQTT", 4) => Some(ProtocolVersion::V3_1_1),
            _ => None,
        }
    }
}

/// Correlation id of a QoS>0 exchange.
///
/// `AssignOnPersist` asks the store to allocate a fresh id when the message is
/// persisted; `Will` marks a publish materialized from a stored Will.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Packet(u16),
    AssignOnPersist,
    Will,
}

impl MessageId {
    pub fn packet(self) -> Option<u16> {
        match self {
            MessageId::Packet(id) => Some(id),
            MessageId::AssignOnPersist | MessageId::Will => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Packet(id) => write!(f, "{id}"),
            MessageId::AssignOnPersist => f.write_str("assign"),
            MessageId::Will => f.write_str("will"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub message_id: Option<MessageId>,
    pub qos: Qos,
    pub dup: bool,
    pub retain: bool,
}

impl Header {
    pub fn with_id(id: u16) -> Self {
        Self {
            message_id: Some(MessageId::Packet(id)),
            ..Self::default()
        }
    }

    pub fn packet_id(&self) -> Option<u16> {
        self.message_id.and_then(MessageId::packet)
    }
}

/// Routing metadata attached by the session layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub partition: String,
    pub client_id: String,
    pub session_id: String,
    pub connection_id: String,
    pub node_id: String,
    pub cluster: String,
}

/// CONNACK return codes from MQTT 3.1.1 §3.2.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUsernameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUsernameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// SUBACK grant for a single filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckResult {
    Granted(Qos),
    Failure,
}

impl SubAckResult {
    pub const FAILURE_CODE: u8 = 0x80;

    pub fn code(self) -> u8 {
        match self {
            SubAckResult::Granted(qos) => qos.as_u8(),
            SubAckResult::Failure => Self::FAILURE_CODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    /// Delivery address for transports without a persistent connection.
    pub protocol_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
}

/// Publish template stored at CONNECT and sent when the client drops uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl Will {
    /// Materialize the Will as a publish message flagged with the Will sentinel id.
    pub fn to_message(&self) -> Message {
        Message::new(
            Header {
                message_id: Some(MessageId::Will),
                qos: self.qos,
                dup: false,
                retain: self.retain,
            },
            Packet::Publish(Publish {
                topic: self.topic.clone(),
                payload: self.payload.clone(),
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRequest {
    pub filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub topics: Vec<TopicRequest>,
    pub protocol_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub granted: Vec<SubAckResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    /// `true` when the client sent DISCONNECT, `false` when the connection dropped.
    pub clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck,
    PublishReceived,
    Release,
    Complete,
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck,
    Disconnect(Disconnect),
    Ping,
    Will,
}

impl Packet {
    pub fn label(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "connect",
            Packet::ConnectAck(_) => "connack",
            Packet::Publish(_) => "publish",
            Packet::PublishAck => "puback",
            Packet::PublishReceived => "pubrec",
            Packet::Release => "pubrel",
            Packet::Complete => "pubcomp",
            Packet::Subscribe(_) => "subscribe",
            Packet::SubscribeAck(_) => "suback",
            Packet::Unsubscribe(_) => "unsubscribe",
            Packet::UnsubscribeAck => "unsuback",
            Packet::Disconnect(_) => "disconnect",
            Packet::Ping => "ping",
            Packet::Will => "will",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub route: Route,
    pub packet: Packet,
}

impl Message {
    pub fn new(header: Header, packet: Packet) -> Self {
        Self {
            header,
            route: Route::default(),
            packet,
        }
    }

    /// Bare acknowledgement carrying only a packet id.
    pub fn ack(packet: Packet, id: u16) -> Self {
        Self::new(Header::with_id(id), packet)
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Build a reply that keeps this message's routing and message id.
    pub fn reply(&self, packet: Packet) -> Self {
        Self {
            header: Header {
                message_id: self.header.message_id,
                ..Header::default()
            },
            route: self.route.clone(),
            packet,
        }
    }

    pub fn publish(&self) -> Option<&Publish> {
        match &self.packet {
            Packet::Publish(publish) => Some(publish),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_ordering_follows_level() {
        assert!(Qos::AtMostOnce < Qos::AtLeastOnce);
        assert!(Qos::AtLeastOnce < Qos::ExactlyOnce);
        assert_eq!(Qos::from_u8(2), Some(Qos::ExactlyOnce));
        assert_eq!(Qos::from_u8(3), None);
    }

    #[test]
    fn negotiate_accepts_only_v3_names() {
        assert_eq!(
            ProtocolVersion::negotiate("MQTT", 4),
            Some(ProtocolVersion::V3_1_1)
        );
        assert_eq!(
            ProtocolVersion::negotiate("MQIsdp", 3),
            Some(ProtocolVersion::V3_1)
        );
        assert_eq!(ProtocolVersion::negotiate("MQTT", 5), None);
        assert_eq!(ProtocolVersion::negotiate("MQIsdp", 4), None);
    }

    #[test]
    fn reply_keeps_route_and_id() {
        let route = Route {
            partition: "p1".into(),
            client_id: "dev1".into(),
            ..Route::default()
        };
        let mut header = Header::with_id(7);
        header.qos = Qos::AtLeastOnce;
        let msg = Message::new(
            header,
            Packet::Publish(Publish {
                topic: "a/b".into(),
                payload: Bytes::from_static(b"x"),
            }),
        )
        .with_route(route.clone());
        let ack = msg.reply(Packet::PublishAck);
        assert_eq!(ack.header.packet_id(), Some(7));
        assert_eq!(ack.header.qos, Qos::AtMostOnce);
        assert_eq!(ack.route, route);
    }

    #[test]
    fn suback_failure_code() {
        assert_eq!(SubAckResult::Failure.code(), 0x80);
        assert_eq!(SubAckResult::Granted(Qos::AtLeastOnce).code(), 1);
    }
}
