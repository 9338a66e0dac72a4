use super::discard_state;
use crate::broker::session::Session;
use crate::broker::{Broker, BrokerError};
use crate::ops::audit;
use crate::store::KeyLocks;
use tracing::{debug, info, warn};

/// End a session.
///
/// `clean` is a client DISCONNECT: the Will is discarded and the connection
/// closed. Otherwise the connection is already gone and the Will, if any, is
/// published. Clean-session state is removed either way.
pub(crate) async fn handle(
    broker: &Broker,
    session: &Session,
    clean: bool,
) -> Result<(), BrokerError> {
    let (partition, client_id) = (session.partition(), session.client_id());
    if clean {
        broker.store.remove_will(partition, client_id).await?;
        broker.sessions.close(&session.session_id);
    }

    let removed = {
        let _guard = broker
            .locks
            .lock(&KeyLocks::client_key(partition, client_id))
            .await;
        let Some(mut record) = broker.store.get_client(partition, client_id).await? else {
            debug!(
                "disconnect without client record partition={} client_id={}",
                partition, client_id
            );
            if clean {
                broker.close_connection(session.route.clone());
            }
            return Ok(());
        };
        if record.session_id != session.session_id || record.connection_id != session.connection_id
        {
            // Taken over by a newer connection; its state is not ours to touch.
            debug!(
                "stale disconnect partition={} client_id={} session_id={}",
                partition, client_id, session.session_id
            );
            if clean {
                broker.close_connection(session.route.clone());
            }
            return Ok(());
        }
        record.active = false;
        broker.store.save_client(&record).await?;

        if !clean {
            if let Err(err) = publish_will(broker, session).await {
                warn!(
                    "will publish failed partition={} client_id={} err={}",
                    partition, client_id, err
                );
            }
        }

        if record.clean_session {
            discard_state(broker, partition, client_id, &record.subscriptions).await?;
            broker.store.remove_client(partition, client_id).await?;
            broker.store.remove_will(partition, client_id).await?;
            true
        } else {
            false
        }
    };

    if removed {
        audit::emit(
            audit::SESSION_REMOVED,
            partition,
            client_id,
            &format!("session {}", session.session_id),
        );
    }
    info!(
        "client disconnected partition={} client_id={} clean={} session_removed={}",
        partition, client_id, clean, removed
    );
    if clean {
        broker.close_connection(session.route.clone());
    }
    Ok(())
}

/// Publish and forget the stored Will of `session`'s client.
pub(crate) async fn publish_will(broker: &Broker, session: &Session) -> Result<(), BrokerError> {
    let (partition, client_id) = (session.partition(), session.client_id());
    let Some(will) = broker.store.get_will(partition, client_id).await? else {
        return Ok(());
    };
    let message = will.to_message().with_route(session.route.clone());
    let recipients = broker.fanout.publish(&message).await?;
    broker.store.remove_will(partition, client_id).await?;
    audit::emit(
        audit::WILL_PUBLISHED,
        partition,
        client_id,
        &format!("topic {} recipients {}", will.topic, recipients),
    );
    Ok(())
}
