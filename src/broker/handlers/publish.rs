use super::{packet_id, reply};
use crate::auth::Permission;
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::mqtt::topic::validate_topic_name;
use crate::mqtt::{Message, Packet, Qos};
use crate::ops::audit;
use crate::store::{Direction, InFlightRecord};
use tracing::debug;

/// Client PUBLISH.
///
/// QoS 0 and 1 fan out immediately. QoS 2 is held as an inbound in-flight
/// record until PUBREL, so a retransmitted PUBLISH only re-sends PUBREC.
pub(crate) async fn handle(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    let Some(publish) = message.publish() else {
        return Err(BrokerError::Internal("publish handler without publish".into()));
    };
    validate_topic_name(&publish.topic)
        .map_err(|err| BrokerError::ProtocolViolation(format!("publish topic: {err}")))?;
    if !session
        .permissions
        .permits(&Permission::publish(&publish.topic), &session.principal)
    {
        audit::emit(
            audit::PUBLISH_DENIED,
            session.partition(),
            session.client_id(),
            &publish.topic,
        );
        return Err(BrokerError::NotAuthorized(format!(
            "publish to {}",
            publish.topic
        )));
    }

    let stamped = message.clone().with_route(session.route.clone());
    match stamped.header.qos {
        Qos::AtMostOnce => {
            broker.fanout.publish(&stamped).await?;
        }
        Qos::AtLeastOnce => {
            let id = packet_id(&stamped)?;
            broker.fanout.publish(&stamped).await?;
            broker.push(Message::ack(Packet::PublishAck, id).with_route(session.route.clone()));
        }
        Qos::ExactlyOnce => {
            let id = packet_id(&stamped)?;
            let held = broker
                .store
                .get_in_flight(session.partition(), session.client_id(), id, Direction::Inbound)
                .await?;
            // A released record is finished; its id is free for a new publish.
            if held.is_some_and(|record| !record.released) {
                debug!(
                    "duplicate qos2 publish partition={} client_id={} message_id={}",
                    session.partition(),
                    session.client_id(),
                    id
                );
            } else {
                broker
                    .store
                    .save_in_flight(
                        session.partition(),
                        session.client_id(),
                        InFlightRecord::new(Direction::Inbound, stamped.clone()),
                    )
                    .await?;
            }
            broker.push(reply(session, &stamped, Packet::PublishReceived));
        }
    }
    Ok(())
}
