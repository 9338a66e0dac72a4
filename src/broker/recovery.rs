//! Replay of unfinished QoS 1/2 handshakes when a persistent session resumes.

use super::error::BrokerError;
use super::sink::Outbound;
use crate::mqtt::{Message, Packet, Qos, Route};
use crate::store::{Direction, InFlightRecord, SessionStore};
use futures::StreamExt;
use tracing::{debug, info, warn};

/// What replaying one stored record amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Inbound QoS 2 still waiting for PUBREL: PUBREC again.
    ReceivedAgain,
    /// Outbound QoS 2 past PUBREC: PUBREL again.
    ReleaseAgain,
    /// Outbound publish not yet acknowledged: redeliver with DUP set.
    Redeliver,
    /// Handshake already finished on our side; the record is dropped.
    Discard,
}

pub fn plan(record: &InFlightRecord) -> Replay {
    match (record.direction, record.header().qos, record.released) {
        (Direction::Inbound, Qos::ExactlyOnce, false) => Replay::ReceivedAgain,
        (Direction::Inbound, _, _) => Replay::Discard,
        (Direction::Outbound, Qos::ExactlyOnce, true) => Replay::ReleaseAgain,
        (Direction::Outbound, _, _) => Replay::Redeliver,
    }
}

/// Walk the client's in-flight records and resume each handshake on `route`.
///
/// Returns how many messages were pushed. A record that fails to replay is
/// logged and left in place for the next resumption.
pub async fn resume(
    store: &dyn SessionStore,
    sink: &dyn Outbound,
    route: &Route,
) -> Result<usize, BrokerError> {
    let mut records = Vec::new();
    let mut stream = store.get_all_in_flight(&route.partition, &route.client_id);
    while let Some(record) = stream.next().await {
        records.push(record?);
    }
    drop(stream);

    let mut pushed = 0;
    for record in records {
        let Some(id) = record.message_id() else {
            warn!(
                "in-flight record without id partition={} client_id={}",
                route.partition, route.client_id
            );
            continue;
        };
        match replay_one(store, sink, route, id, &record).await {
            Ok(true) => pushed += 1,
            Ok(false) => {}
            Err(err) => warn!(
                "replay failed partition={} client_id={} message_id={} err={}",
                route.partition, route.client_id, id, err
            ),
        }
    }
    if pushed > 0 {
        info!(
            "resumed in-flight partition={} client_id={} replayed={}",
            route.partition, route.client_id, pushed
        );
    }
    Ok(pushed)
}

async fn replay_one(
    store: &dyn SessionStore,
    sink: &dyn Outbound,
    route: &Route,
    id: u16,
    record: &InFlightRecord,
) -> Result<bool, BrokerError> {
    let message = match plan(record) {
        Replay::ReceivedAgain => Message::ack(Packet::PublishReceived, id).with_route(route.clone()),
        Replay::ReleaseAgain => Message::ack(Packet::Release, id).with_route(route.clone()),
        Replay::Redeliver => {
            let mut message = record.message.clone();
            message.header.dup = true;
            message.route = route.clone();
            message
        }
        Replay::Discard => {
            debug!(
                "discarding finished in-flight partition={} client_id={} message_id={}",
                route.partition, route.client_id, id
            );
            store
                .remove_in_flight(&route.partition, &route.client_id, id, record.direction)
                .await?;
            return Ok(false);
        }
    };
    sink.push(&route.cluster, &route.node_id, message)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sink::RecordingSink;
    use crate::mqtt::{Header, MessageId, Publish};
    use crate::store::MemoryStore;
    use bytes::Bytes;

    fn stored(direction: Direction, qos: Qos, id: u16, released: bool) -> InFlightRecord {
        let mut record = InFlightRecord::new(
            direction,
            Message::new(
                Header {
                    message_id: Some(MessageId::Packet(id)),
                    qos,
                    dup: false,
                    retain: false,
                },
                Packet::Publish(Publish {
                    topic: "a/b".into(),
                    payload: Bytes::from_static(b"x"),
                }),
            ),
        );
        record.released = released;
        record
    }

    fn route() -> Route {
        Route {
            partition: "p1".into(),
            client_id: "dev1".into(),
            session_id: "s2".into(),
            connection_id: "c2".into(),
            node_id: "n".into(),
            cluster: "k".into(),
        }
    }

    #[test]
    fn plan_per_direction_and_state() {
        use Direction::*;
        assert_eq!(
            plan(&stored(Inbound, Qos::ExactlyOnce, 1, false)),
            Replay::ReceivedAgain
        );
        assert_eq!(
            plan(&stored(Inbound, Qos::ExactlyOnce, 1, true)),
            Replay::Discard
        );
        assert_eq!(
            plan(&stored(Outbound, Qos::ExactlyOnce, 1, true)),
            Replay::ReleaseAgain
        );
        assert_eq!(
            plan(&stored(Outbound, Qos::ExactlyOnce, 1, false)),
            Replay::Redeliver
        );
        assert_eq!(
            plan(&stored(Outbound, Qos::AtLeastOnce, 1, false)),
            Replay::Redeliver
        );
    }

    #[tokio::test]
    async fn resume_pushes_each_step_on_new_route() {
        let store = MemoryStore::new();
        let sink = RecordingSink::new();
        for record in [
            stored(Direction::Inbound, Qos::ExactlyOnce, 3, false),
            stored(Direction::Outbound, Qos::AtLeastOnce, 4, false),
            stored(Direction::Outbound, Qos::ExactlyOnce, 5, true),
            stored(Direction::Inbound, Qos::ExactlyOnce, 6, true),
        ] {
            store.save_in_flight("p1", "dev1", record).await.unwrap();
        }
        let pushed = resume(&store, &sink, &route()).await.unwrap();
        assert_eq!(pushed, 3);
        let messages = sink.take();
        assert!(messages.iter().all(|m| m.route.connection_id == "c2"));
        let labels: Vec<_> = messages
            .iter()
            .map(|m| (m.packet.label(), m.header.packet_id()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("pubrec", Some(3)),
                ("publish", Some(4)),
                ("pubrel", Some(5)),
            ]
        );
        assert!(messages[1].header.dup);
        assert_eq!(store.in_flight_count("p1", "dev1"), 3);
    }
}
