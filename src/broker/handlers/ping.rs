use super::reply;
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::mqtt::{Message, Packet};
use tracing::debug;

/// PINGREQ: answer while the client record exists, otherwise drop silently.
pub(crate) async fn handle(
    broker: &Broker,
    session: &Session,
    message: &Message,
) -> Result<(), BrokerError> {
    if broker
        .store
        .get_client(session.partition(), session.client_id())
        .await?
        .is_none()
    {
        debug!(
            "ping without client record partition={} client_id={}",
            session.partition(),
            session.client_id()
        );
        return Ok(());
    }
    broker.push(reply(session, message, Packet::Ping));
    Ok(())
}
