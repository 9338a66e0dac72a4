//! One handler per inbound message kind, dispatched by `Broker::dispatch`.

pub(super) mod acks;
pub(super) mod connect;
pub(super) mod disconnect;
pub(super) mod ping;
pub(super) mod publish;
pub(super) mod subscribe;

use super::error::BrokerError;
use super::session::Session;
use super::Broker;
use crate::mqtt::{Message, Packet, SubscriptionKey};
use crate::store::Direction;
use futures::StreamExt;
use std::collections::BTreeSet;

/// Reply to `message` on the session's route.
fn reply(session: &Session, message: &Message, packet: Packet) -> Message {
    message.reply(packet).with_route(session.route.clone())
}

fn packet_id(message: &Message) -> Result<u16, BrokerError> {
    message.header.packet_id().ok_or_else(|| {
        BrokerError::ProtocolViolation(format!("{} without message id", message.packet.label()))
    })
}

/// Drop a client's subscriptions and in-flight state.
///
/// Only subscription key locks are taken, so callers may hold the client lock.
async fn discard_state(
    broker: &Broker,
    partition: &str,
    client_id: &str,
    subscriptions: &BTreeSet<SubscriptionKey>,
) -> Result<(), BrokerError> {
    for key in subscriptions {
        broker.fanout.detach(key, client_id).await?;
    }
    let mut stale: Vec<(u16, Direction)> = Vec::new();
    let mut records = broker.store.get_all_in_flight(partition, client_id);
    while let Some(record) = records.next().await {
        let record = record?;
        if let Some(id) = record.message_id() {
            stale.push((id, record.direction));
        }
    }
    drop(records);
    for (id, direction) in stale {
        broker
            .store
            .remove_in_flight(partition, client_id, id, direction)
            .await?;
    }
    Ok(())
}
