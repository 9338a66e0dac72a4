//! MQTT 3.1/3.1.1 message model, topics and wire codec.

pub mod client_id;
pub mod codec;
pub mod message;
pub mod topic;

pub use client_id::{ClientIdPolicy, ClientIdValidation};
pub use codec::CodecError;
pub use message::{
    Connect, ConnectAck, ConnectReturnCode, Disconnect, Header, Message, MessageId, Packet,
    ProtocolVersion, Publish, Qos, Route, SubAckResult, Subscribe, SubscribeAck, TopicRequest,
    Unsubscribe, Will,
};
pub use topic::{breakdown, SubscriptionKey, TopicError};
