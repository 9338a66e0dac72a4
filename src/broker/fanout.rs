//! Topic fan-out: subscription registry updates and publish distribution.

use super::error::BrokerError;
use super::sink::Outbound;
use crate::mqtt::{
    Header, Message, MessageId, Qos, Route, SubAckResult, SubscriptionKey, TopicRequest,
};
use crate::store::{
    ClientRecord, Direction, InFlightRecord, KeyLocks, SessionStore, SubscriptionRecord,
};
use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FanoutEngine {
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn Outbound>,
    locks: Arc<KeyLocks>,
}

impl FanoutEngine {
    pub fn new(store: Arc<dyn SessionStore>, sink: Arc<dyn Outbound>, locks: Arc<KeyLocks>) -> Self {
        Self { store, sink, locks }
    }

    /// Register `client_id` for every request, in order.
    ///
    /// A filter already held at another QoS moves to the new bucket. Each step
    /// is an add-to-set, so repeating a partially failed call converges.
    pub async fn subscribe(
        &self,
        partition: &str,
        client_id: &str,
        requests: &[TopicRequest],
    ) -> Vec<SubAckResult> {
        let mut granted = Vec::with_capacity(requests.len());
        for request in requests {
            let key = SubscriptionKey::new(partition, request.qos, request.filter.clone());
            match self.subscribe_one(partition, client_id, &key).await {
                Ok(()) => granted.push(SubAckResult::Granted(request.qos)),
                Err(err) => {
                    warn!(
                        "subscribe failed partition={} client_id={} key={} err={}",
                        partition, client_id, key, err
                    );
                    granted.push(SubAckResult::Failure);
                }
            }
        }
        granted
    }

    async fn subscribe_one(
        &self,
        partition: &str,
        client_id: &str,
        key: &SubscriptionKey,
    ) -> Result<(), BrokerError> {
        let previous: Vec<SubscriptionKey> = self
            .store
            .get_client(partition, client_id)
            .await?
            .map(|client| {
                client
                    .subscriptions
                    .into_iter()
                    .filter(|held| held.filter == key.filter && held.qos != key.qos)
                    .collect()
            })
            .unwrap_or_default();
        for stale in &previous {
            self.unsubscribe(partition, client_id, stale).await?;
        }

        {
            let _guard = self.locks.lock(&KeyLocks::subscription_key(key)).await;
            let mut record = self
                .store
                .get_subscription(key)
                .await?
                .unwrap_or_else(|| SubscriptionRecord::new(key.clone()));
            if record.clients.insert(client_id.to_string()) {
                self.store.save_subscription(&record).await?;
            }
        }

        self.update_client(partition, client_id, |client| {
            client.subscriptions.insert(key.clone())
        })
        .await
    }

    /// Remove `client_id` from `key` and `key` from the client's filter set.
    pub async fn unsubscribe(
        &self,
        partition: &str,
        client_id: &str,
        key: &SubscriptionKey,
    ) -> Result<(), BrokerError> {
        self.detach(key, client_id).await?;
        self.update_client(partition, client_id, |client| {
            client.subscriptions.remove(key)
        })
        .await
    }

    /// Remove `client_id` from the subscriber set of `key` only.
    ///
    /// The subscription record is deleted once its set is empty.
    pub async fn detach(&self, key: &SubscriptionKey, client_id: &str) -> Result<(), BrokerError> {
        let _guard = self.locks.lock(&KeyLocks::subscription_key(key)).await;
        let Some(mut record) = self.store.get_subscription(key).await? else {
            return Ok(());
        };
        if !record.clients.remove(client_id) {
            return Ok(());
        }
        if record.clients.is_empty() {
            self.store.remove_subscription(key).await?;
        } else {
            self.store.save_subscription(&record).await?;
        }
        Ok(())
    }

    async fn update_client(
        &self,
        partition: &str,
        client_id: &str,
        mutate: impl FnOnce(&mut ClientRecord) -> bool,
    ) -> Result<(), BrokerError> {
        let _guard = self
            .locks
            .lock(&KeyLocks::client_key(partition, client_id))
            .await;
        let Some(mut client) = self.store.get_client(partition, client_id).await? else {
            return Ok(());
        };
        if mutate(&mut client) {
            self.store.save_client(&client).await?;
        }
        Ok(())
    }

    /// Distribute a publish to every matching subscriber.
    ///
    /// Every QoS bucket is consulted; a recipient gets `min(publish qos,
    /// bucket qos)` and one copy at the highest eligible QoS. Per-recipient
    /// failures are logged and skipped. Returns the number of recipients that
    /// received or queued a copy.
    pub async fn publish(&self, message: &Message) -> Result<usize, BrokerError> {
        let Some(publish) = message.publish() else {
            return Err(BrokerError::Internal(format!(
                "fan-out of non-publish {}",
                message.packet.label()
            )));
        };
        let partition = message.route.partition.as_str();
        let candidates = SubscriptionKey::candidates(partition, &publish.topic);
        let mut recipients: HashMap<String, Qos> = HashMap::new();
        let mut subscribers = self.store.distribute_publish(&candidates, message);
        while let Some(subscriber) = subscribers.next().await {
            let subscriber = subscriber?;
            let qos = message.header.qos.min(subscriber.key.qos);
            recipients
                .entry(subscriber.client_id)
                .and_modify(|held| *held = (*held).max(qos))
                .or_insert(qos);
        }
        drop(subscribers);

        let deliveries = recipients.into_iter().map(|(client_id, qos)| async move {
            let result = self.deliver(partition, &client_id, qos, message).await;
            (client_id, result)
        });
        let mut delivered = 0;
        for (client_id, result) in join_all(deliveries).await {
            match result {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    "delivery failed partition={} client_id={} topic={} err={}",
                    partition, client_id, publish.topic, err
                ),
            }
        }
        debug!(
            "fan-out partition={} topic={} qos={} recipients={}",
            partition, publish.topic, message.header.qos, delivered
        );
        Ok(delivered)
    }

    async fn deliver(
        &self,
        partition: &str,
        client_id: &str,
        qos: Qos,
        message: &Message,
    ) -> Result<bool, BrokerError> {
        let Some(client) = self.store.get_client(partition, client_id).await? else {
            debug!(
                "dropping delivery to unknown client partition={} client_id={}",
                partition, client_id
            );
            return Ok(false);
        };
        if qos == Qos::AtMostOnce && !client.active {
            return Ok(false);
        }
        let mut copy = Message {
            header: Header {
                message_id: (qos != Qos::AtMostOnce).then_some(MessageId::AssignOnPersist),
                qos,
                dup: false,
                retain: false,
            },
            route: recipient_route(&client),
            packet: message.packet.clone(),
        };
        if qos != Qos::AtMostOnce {
            let id = self
                .store
                .save_in_flight(
                    partition,
                    client_id,
                    InFlightRecord::new(Direction::Outbound, copy.clone()),
                )
                .await?;
            copy.header.message_id = Some(MessageId::Packet(id));
        }
        if client.active {
            let route = copy.route.clone();
            self.sink.push(&route.cluster, &route.node_id, copy)?;
        }
        Ok(true)
    }
}

/// Route addressing the live connection of `client`.
pub fn recipient_route(client: &ClientRecord) -> Route {
    Route {
        partition: client.partition.clone(),
        client_id: client.client_id.clone(),
        session_id: client.session_id.clone(),
        connection_id: client.connection_id.clone(),
        node_id: client.connected_node.clone(),
        cluster: client.connected_cluster.clone(),
    }
}
