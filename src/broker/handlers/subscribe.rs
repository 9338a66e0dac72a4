use super::reply;
use crate::auth::Permission;
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::mqtt::topic::validate_topic_filter;
use crate::mqtt::{
    Message, Packet, Qos, SubAckResult, Subscribe, SubscribeAck, SubscriptionKey, TopicRequest,
    Unsubscribe,
};
use crate::ops::audit;
use crate::store::KeyLocks;
use tracing::debug;

/// SUBSCRIBE: one SUBACK result per requested filter, in request order.
///
/// Rejected filters (malformed or not permitted) answer `Failure` without
/// failing the others.
pub(crate) async fn subscribe(
    broker: &Broker,
    session: &Session,
    message: &Message,
    subscribe: &Subscribe,
) -> Result<(), BrokerError> {
    let (partition, client_id) = (session.partition(), session.client_id());
    if let Some(protocol_data) = &subscribe.protocol_data {
        let _guard = broker
            .locks
            .lock(&KeyLocks::client_key(partition, client_id))
            .await;
        if let Some(mut record) = broker.store.get_client(partition, client_id).await? {
            if record.protocol_data.as_ref() != Some(protocol_data) {
                record.protocol_data = Some(protocol_data.clone());
                broker.store.save_client(&record).await?;
            }
        }
    }

    let mut results: Vec<Option<SubAckResult>> = vec![None; subscribe.topics.len()];
    let mut accepted = Vec::new();
    let mut positions = Vec::new();
    for (index, request) in subscribe.topics.iter().enumerate() {
        if let Err(err) = validate_topic_filter(&request.filter) {
            debug!(
                "rejecting filter partition={} client_id={} filter={:?} err={}",
                partition, client_id, request.filter, err
            );
            results[index] = Some(SubAckResult::Failure);
            continue;
        }
        if !session
            .permissions
            .permits(&Permission::subscribe(&request.filter), &session.principal)
        {
            audit::emit(
                audit::SUBSCRIBE_DENIED,
                partition,
                client_id,
                &request.filter,
            );
            results[index] = Some(SubAckResult::Failure);
            continue;
        }
        accepted.push(TopicRequest {
            filter: request.filter.clone(),
            qos: request.qos.min(broker.settings.max_qos),
        });
        positions.push(index);
    }

    let granted = broker.fanout.subscribe(partition, client_id, &accepted).await;
    for (index, result) in positions.into_iter().zip(granted) {
        results[index] = Some(result);
    }
    let granted = results
        .into_iter()
        .map(|result| result.unwrap_or(SubAckResult::Failure))
        .collect();
    broker.push(reply(
        session,
        message,
        Packet::SubscribeAck(SubscribeAck { granted }),
    ));
    Ok(())
}

/// UNSUBSCRIBE: drop each filter from every QoS bucket. Always answered.
pub(crate) async fn unsubscribe(
    broker: &Broker,
    session: &Session,
    message: &Message,
    unsubscribe: &Unsubscribe,
) -> Result<(), BrokerError> {
    let (partition, client_id) = (session.partition(), session.client_id());
    for filter in &unsubscribe.filters {
        if validate_topic_filter(filter).is_err()
            || !session
                .permissions
                .permits(&Permission::subscribe(filter), &session.principal)
        {
            debug!(
                "ignoring unsubscribe partition={} client_id={} filter={:?}",
                partition, client_id, filter
            );
            continue;
        }
        for qos in Qos::ALL {
            let key = SubscriptionKey::new(partition, qos, filter.clone());
            broker.fanout.unsubscribe(partition, client_id, &key).await?;
        }
    }
    broker.push(reply(session, message, Packet::UnsubscribeAck));
    Ok(())
}
