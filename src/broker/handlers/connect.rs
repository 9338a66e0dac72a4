use super::discard_state;
use crate::auth::{Permission, PermissionSet, Principal};
use crate::broker::fanout::recipient_route;
use crate::broker::recovery;
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::mqtt::topic::validate_topic_name;
use crate::mqtt::{
    ClientIdValidation, Connect, ConnectAck, ConnectReturnCode, Header, Message, Packet,
    ProtocolVersion, Route,
};
use crate::ops::audit;
use crate::store::{ClientRecord, KeyLocks};
use tracing::{info, warn};
use uuid::Uuid;

/// CONNECT: negotiate, authenticate, open the session and resume in-flight work.
///
/// Every rejection that has a return code is answered with that CONNACK
/// before the error is returned; the caller then closes the connection.
pub(crate) async fn handle(
    broker: &Broker,
    connection_id: &str,
    connect: &Connect,
) -> Result<(), BrokerError> {
    let mut route = broker.local_route(connection_id);
    match accept(broker, connection_id, connect, &mut route).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let client = if route.client_id.is_empty() {
                connect.client_id.as_str()
            } else {
                route.client_id.as_str()
            };
            audit::emit(
                audit::CONNECT_REJECTED,
                &route.partition,
                client,
                &err.to_string(),
            );
            if let Some(code) = err.connack_code() {
                broker.push(connack(false, code, route.clone()));
            }
            if !err.is_fatal() {
                // A refused CONNECT ends the connection even when retriable.
                broker.close_connection(route);
            }
            Err(err)
        }
    }
}

fn connack(session_present: bool, code: ConnectReturnCode, route: Route) -> Message {
    Message::new(
        Header::default(),
        Packet::ConnectAck(ConnectAck {
            session_present,
            code,
        }),
    )
    .with_route(route)
}

async fn accept(
    broker: &Broker,
    connection_id: &str,
    connect: &Connect,
    route: &mut Route,
) -> Result<(), BrokerError> {
    let protocol = ProtocolVersion::negotiate(&connect.protocol_name, connect.protocol_level)
        .ok_or_else(|| BrokerError::UnacceptableProtocol {
            name: connect.protocol_name.clone(),
            level: connect.protocol_level,
        })?;

    let policy = &broker.settings.client_ids;
    let client_id = match policy.validate(&connect.client_id) {
        ClientIdValidation::Valid => connect.client_id.clone(),
        ClientIdValidation::Empty if connect.clean_session => {
            policy.assigned(&broker.store.next_client_id().await?)
        }
        ClientIdValidation::Empty => {
            return Err(BrokerError::IdentifierRejected(
                "empty client id requires a clean session".into(),
            ))
        }
        ClientIdValidation::InvalidCharacters => {
            return Err(BrokerError::IdentifierRejected(format!(
                "client id {:?} is not allowed",
                connect.client_id
            )))
        }
    };

    let resolved = broker
        .settings
        .partitions
        .resolve(connect.username.as_deref(), &client_id);
    route.partition = resolved.partition.clone();
    route.client_id = client_id.clone();
    let partition = resolved.partition;

    let account = broker
        .identity
        .authenticate(
            &partition,
            resolved.username.as_deref(),
            connect.password.as_deref(),
        )
        .await?;
    let granted = broker
        .identity
        .get_permissions(&partition, account.username.as_deref())
        .await?;
    let permissions = PermissionSet::parse(
        granted.iter().map(String::as_str),
        broker.settings.case_sensitive,
    )
    .map_err(|err| BrokerError::Internal(err.to_string()))?;
    let principal = Principal {
        partition: partition.clone(),
        username: account.username,
        client_id: client_id.clone(),
    };

    if let Some(will) = &connect.will {
        validate_topic_name(&will.topic)
            .map_err(|err| BrokerError::ProtocolViolation(format!("will topic: {err}")))?;
        if !permissions.permits(&Permission::publish(&will.topic), &principal) {
            audit::emit(
                audit::PUBLISH_DENIED,
                &partition,
                &client_id,
                &format!("will topic {}", will.topic),
            );
            return Err(BrokerError::NotAuthorized(format!(
                "will topic {}",
                will.topic
            )));
        }
    }

    let session_id = Uuid::new_v4().to_string();
    route.session_id = session_id.clone();

    let session_present = {
        let _guard = broker
            .locks
            .lock(&KeyLocks::client_key(&partition, &client_id))
            .await;
        let existing = broker.store.get_client(&partition, &client_id).await?;
        if let Some(previous) = &existing {
            if previous.active && previous.connection_id != connection_id {
                take_over(broker, previous);
            }
        }
        let session_present = existing.is_some() && !connect.clean_session;
        let mut record =
            existing.unwrap_or_else(|| ClientRecord::new(partition.clone(), client_id.clone()));
        if connect.clean_session {
            let held = std::mem::take(&mut record.subscriptions);
            discard_state(broker, &partition, &client_id, &held).await?;
        }
        record.session_id = session_id.clone();
        record.connected_cluster = route.cluster.clone();
        record.connected_node = route.node_id.clone();
        record.connection_id = connection_id.to_string();
        record.active = true;
        record.clean_session = connect.clean_session;
        record.protocol = protocol;
        if connect.protocol_data.is_some() {
            record.protocol_data = connect.protocol_data.clone();
        }
        broker.store.save_client(&record).await?;
        session_present
    };

    match &connect.will {
        Some(will) => broker.store.save_will(&partition, &client_id, will).await?,
        None => broker.store.remove_will(&partition, &client_id).await?,
    }

    broker.sessions.open(Session {
        session_id: session_id.clone(),
        connection_id: connection_id.to_string(),
        principal,
        permissions,
        clean_session: connect.clean_session,
        protocol,
        route: route.clone(),
    });
    broker.push(connack(
        session_present,
        ConnectReturnCode::Accepted,
        route.clone(),
    ));
    audit::emit(
        audit::CONNECT_ACCEPTED,
        &partition,
        &client_id,
        &format!("session {session_id}"),
    );
    info!(
        "client connected partition={} client_id={} session_id={} clean_session={} session_present={}",
        partition, client_id, session_id, connect.clean_session, session_present
    );

    if session_present {
        if let Err(err) = recovery::resume(broker.store.as_ref(), broker.sink.as_ref(), route).await
        {
            warn!(
                "in-flight recovery failed partition={} client_id={} err={}",
                partition, client_id, err
            );
        }
    }
    Ok(())
}

/// Close the connection that currently owns `previous` (MQTT 3.1.1 §3.1.4).
fn take_over(broker: &Broker, previous: &ClientRecord) {
    broker.sessions.close_connection(&previous.connection_id);
    broker.close_connection(recipient_route(previous));
    audit::emit(
        audit::SESSION_TAKEN_OVER,
        &previous.partition,
        &previous.client_id,
        &format!("connection {} replaced", previous.connection_id),
    );
    info!(
        "session taken over partition={} client_id={} old_connection_id={}",
        previous.partition, previous.client_id, previous.connection_id
    );
}
