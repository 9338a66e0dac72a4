mod common;

use common::{ack, connect, harness, publish, subscribe, Harness};
use tessera::mqtt::{Packet, Qos};
use tessera::store::{Direction, SessionStore};

/// dev2 holds a persistent `sensors/#` subscription and is offline.
async fn offline_subscriber(h: &Harness, qos: Qos) {
    let s2 = h.login("c2", connect("dev2", Some("dev2@p1"), false)).await;
    h.send("c2", &s2, subscribe(1, &[("sensors/#", qos)]))
        .await
        .unwrap();
    h.broker
        .on_connection_closed("c2", Some(&s2))
        .await
        .unwrap();
    h.sink.take();
}

#[tokio::test]
async fn queued_publish_is_redelivered_with_dup_on_resume() {
    let h = harness();
    offline_subscriber(&h, Qos::AtLeastOnce).await;
    let s1 = h.login("c1", connect("dev1", Some("dev1@p1"), true)).await;
    h.send("c1", &s1, publish("sensors/temp", Qos::AtLeastOnce, Some(9)))
        .await
        .unwrap();
    assert!(h.pushed_to("dev2").is_empty());
    assert_eq!(h.store.in_flight_count("p1", "dev2"), 1);

    let opened = h.open("c3", connect("dev2", Some("dev2@p1"), false)).await;
    assert!(opened.outcome.is_ok());
    assert!(opened.ack.session_present);
    assert_eq!(opened.pushed.len(), 1);
    let replay = &opened.pushed[0];
    assert_eq!(replay.publish().unwrap().topic, "sensors/temp");
    assert!(replay.header.dup);
    assert_eq!(replay.route.connection_id, "c3");
    assert_eq!(replay.route.session_id, opened.session_id);

    let id = replay.header.packet_id().unwrap();
    h.send("c3", &opened.session_id, ack(Packet::PublishAck, id))
        .await
        .unwrap();
    assert_eq!(h.store.in_flight_count("p1", "dev2"), 0);
}

#[tokio::test]
async fn unreleased_inbound_qos2_gets_pubrec_again_without_delivery() {
    let h = harness();
    let s2 = h.login("c2", connect("dev2", Some("dev2@p1"), true)).await;
    h.send("c2", &s2, subscribe(1, &[("sensors/#", Qos::ExactlyOnce)]))
        .await
        .unwrap();

    let s1 = h.login("c1", connect("dev1", Some("dev1@p1"), false)).await;
    h.send("c1", &s1, publish("sensors/temp", Qos::ExactlyOnce, Some(11)))
        .await
        .unwrap();
    h.broker
        .on_connection_closed("c1", Some(&s1))
        .await
        .unwrap();
    h.sink.take();

    let opened = h.open("c3", connect("dev1", Some("dev1@p1"), false)).await;
    assert!(opened.ack.session_present);
    assert_eq!(opened.pushed.len(), 1);
    assert_eq!(opened.pushed[0].packet, Packet::PublishReceived);
    assert_eq!(opened.pushed[0].header.packet_id(), Some(11));
    assert_eq!(opened.pushed[0].route.client_id, "dev1");

    h.send("c3", &opened.session_id, ack(Packet::Release, 11))
        .await
        .unwrap();
    let to_dev2: Vec<_> = h
        .sink
        .take()
        .into_iter()
        .filter(|m| m.route.client_id == "dev2" && m.publish().is_some())
        .collect();
    assert_eq!(to_dev2.len(), 1);
}

#[tokio::test]
async fn released_outbound_qos2_gets_pubrel_again() {
    let h = harness();
    let s2 = h.login("c2", connect("dev2", Some("dev2@p1"), false)).await;
    h.send("c2", &s2, subscribe(1, &[("sensors/#", Qos::ExactlyOnce)]))
        .await
        .unwrap();
    let s1 = h.login("c1", connect("dev1", Some("dev1@p1"), true)).await;
    h.send("c1", &s1, publish("sensors/temp", Qos::ExactlyOnce, Some(2)))
        .await
        .unwrap();
    h.send("c1", &s1, ack(Packet::Release, 2)).await.unwrap();
    let delivered = h.pushed_to("dev2");
    let id = delivered
        .iter()
        .find_map(|m| m.publish().and(m.header.packet_id()))
        .unwrap();
    h.send("c2", &s2, ack(Packet::PublishReceived, id))
        .await
        .unwrap();
    h.broker
        .on_connection_closed("c2", Some(&s2))
        .await
        .unwrap();
    h.sink.take();

    let opened = h.open("c3", connect("dev2", Some("dev2@p1"), false)).await;
    assert_eq!(opened.pushed.len(), 1);
    assert_eq!(opened.pushed[0].packet, Packet::Release);
    assert_eq!(opened.pushed[0].header.packet_id(), Some(id));

    h.send("c3", &opened.session_id, ack(Packet::Complete, id))
        .await
        .unwrap();
    assert!(h
        .store
        .get_in_flight("p1", "dev2", id, Direction::Outbound)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn clean_session_reconnect_discards_prior_state() {
    let h = harness();
    offline_subscriber(&h, Qos::AtLeastOnce).await;
    let s1 = h.login("c1", connect("dev1", Some("dev1@p1"), true)).await;
    h.send("c1", &s1, publish("sensors/temp", Qos::AtLeastOnce, Some(1)))
        .await
        .unwrap();
    assert_eq!(h.store.in_flight_count("p1", "dev2"), 1);

    let opened = h.open("c3", connect("dev2", Some("dev2@p1"), true)).await;
    assert!(!opened.ack.session_present);
    assert!(opened.pushed.is_empty());
    assert_eq!(h.store.in_flight_count("p1", "dev2"), 0);
    assert_eq!(h.store.subscription_count(), 0);
}

#[tokio::test]
async fn qos0_is_not_queued_for_offline_clients() {
    let h = harness();
    offline_subscriber(&h, Qos::ExactlyOnce).await;
    let s1 = h.login("c1", connect("dev1", Some("dev1@p1"), true)).await;
    h.send("c1", &s1, publish("sensors/temp", Qos::AtMostOnce, None))
        .await
        .unwrap();
    assert_eq!(h.store.in_flight_count("p1", "dev2"), 0);

    let opened = h.open("c3", connect("dev2", Some("dev2@p1"), false)).await;
    assert!(opened.ack.session_present);
    assert!(opened.pushed.is_empty());
}
