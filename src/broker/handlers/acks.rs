use super::{packet_id, reply};
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::mqtt::{Message, Packet};
use crate::store::Direction;
use tracing::{debug, warn};

/// PUBACK: the QoS 1 delivery to this client is done.
pub(crate) async fn puback(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    finish_outbound(broker, session, packet_id(message)?).await
}

/// PUBCOMP: the QoS 2 delivery to this client is done.
pub(crate) async fn pubcomp(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    finish_outbound(broker, session, packet_id(message)?).await
}

async fn finish_outbound(broker: &Broker, session: &Session, id: u16) -> Result<(), BrokerError> {
    broker
        .store
        .remove_in_flight(session.partition(), session.client_id(), id, Direction::Outbound)
        .await?;
    Ok(())
}

/// PUBREC: the client holds our QoS 2 publish. Mark it released and send PUBREL.
pub(crate) async fn pubrec(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    let id = packet_id(message)?;
    let held = broker
        .store
        .get_in_flight(session.partition(), session.client_id(), id, Direction::Outbound)
        .await?;
    match held {
        Some(mut record) if !record.released => {
            record.released = true;
            broker
                .store
                .save_in_flight(session.partition(), session.client_id(), record)
                .await?;
        }
        Some(_) => {}
        None => debug!(
            "pubrec for unknown message partition={} client_id={} message_id={}",
            session.partition(),
            session.client_id(),
            id
        ),
    }
    broker.push(reply(session, message, Packet::Release));
    Ok(())
}

/// PUBREL: release a held QoS 2 publish to subscribers exactly once, then PUBCOMP.
pub(crate) async fn pubrel(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    let id = packet_id(message)?;
    let (partition, client_id) = (session.partition(), session.client_id());
    let held = broker
        .store
        .get_in_flight(partition, client_id, id, Direction::Inbound)
        .await?;
    if let Some(mut record) = held {
        if !record.released {
            // Mark before distributing; a crash after this point must not
            // release the publish a second time.
            record.released = true;
            broker
                .store
                .save_in_flight(partition, client_id, record.clone())
                .await?;
            if let Err(err) = broker.fanout.publish(&record.message).await {
                // Nothing was delivered; the next PUBREL must try again.
                record.released = false;
                if let Err(restore) = broker
                    .store
                    .save_in_flight(partition, client_id, record)
                    .await
                {
                    warn!(
                        "unable to re-arm held publish partition={} client_id={} message_id={} err={}",
                        partition, client_id, id, restore
                    );
                }
                return Err(err);
            }
        }
        broker.push(reply(session, message, Packet::Complete));
        broker
            .store
            .remove_in_flight(partition, client_id, id, Direction::Inbound)
            .await?;
    } else {
        broker.push(reply(session, message, Packet::Complete));
    }
    Ok(())
}
