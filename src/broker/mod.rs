//! Broker engine: protocol state machine, fan-out, recovery.
//!
//! The transport hands every decoded message to [`Broker::on_message`] in
//! arrival order, one at a time per connection, and reports socket loss via
//! [`Broker::on_connection_closed`]. Responses leave through the [`Outbound`]
//! sink; a pushed `Disconnect` asks the transport to close that connection.

pub mod error;
pub mod fanout;
mod handlers;
pub mod recovery;
pub mod session;
pub mod sink;

pub use error::BrokerError;
pub use fanout::FanoutEngine;
pub use session::{Session, SessionRegistry};
pub use sink::{Outbound, RecordingSink, SinkError};

use crate::auth::{IdentityBackend, PartitionResolver};
use crate::core::config::Config;
use crate::mqtt::{ClientIdPolicy, Disconnect, Header, Message, Packet, Qos, Route};
use crate::store::{KeyLocks, SessionStore};
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine settings derived from the node configuration.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub node_id: String,
    pub cluster: String,
    pub max_qos: Qos,
    pub case_sensitive: bool,
    pub client_ids: ClientIdPolicy,
    pub partitions: PartitionResolver,
}

impl BrokerSettings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let max_qos = Qos::from_u8(cfg.protocol.max_qos)
            .with_context(|| format!("invalid protocol.max_qos {}", cfg.protocol.max_qos))?;
        let client_ids = ClientIdPolicy::new(
            &cfg.protocol.client_id_pattern,
            cfg.protocol.assigned_client_id_prefix.clone(),
        )
        .context("protocol.client_id_pattern")?;
        let partitions =
            PartitionResolver::from_config(&cfg.partitions).context("partitions.client_id_pattern")?;
        Ok(Self {
            node_id: cfg.node.node_id.clone(),
            cluster: cfg.node.cluster.clone(),
            max_qos,
            case_sensitive: cfg.identity.case_sensitive,
            client_ids,
            partitions,
        })
    }
}

pub struct Broker {
    settings: BrokerSettings,
    store: Arc<dyn SessionStore>,
    identity: Arc<dyn IdentityBackend>,
    sink: Arc<dyn Outbound>,
    locks: Arc<KeyLocks>,
    fanout: FanoutEngine,
    sessions: SessionRegistry,
}

impl Broker {
    pub fn new(
        settings: BrokerSettings,
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentityBackend>,
        sink: Arc<dyn Outbound>,
    ) -> Self {
        let locks = Arc::new(KeyLocks::new());
        let fanout = FanoutEngine::new(store.clone(), sink.clone(), locks.clone());
        Self {
            settings,
            store,
            identity,
            sink,
            locks,
            fanout,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Handle one decoded message from `connection_id`.
    ///
    /// `session_id` is the id carried by the CONNACK that accepted the
    /// connection, absent before CONNECT. Acknowledgements and disconnects
    /// have already been pushed when this returns an error.
    pub async fn on_message(
        &self,
        connection_id: &str,
        session_id: Option<&str>,
        message: Message,
    ) -> Result<(), BrokerError> {
        let label = message.packet.label();
        let session = session_id
            .and_then(|id| self.sessions.get(id))
            .filter(|session| session.connection_id == connection_id);
        let result = match (&message.packet, &session) {
            (Packet::Connect(connect), None) => {
                handlers::connect::handle(self, connection_id, connect).await
            }
            (_, Some(session)) => self.dispatch(session, &message).await,
            (_, None) => Err(BrokerError::Unauthenticated),
        };
        if let Err(err) = &result {
            self.fail(connection_id, session.as_deref(), label, err);
        }
        result
    }

    async fn dispatch(&self, session: &Session, message: &Message) -> Result<(), BrokerError> {
        match &message.packet {
            Packet::Connect(_) => Err(BrokerError::ProtocolViolation(
                "second CONNECT on a connection".into(),
            )),
            Packet::Publish(_) => handlers::publish::handle(self, session, message).await,
            Packet::PublishAck => handlers::acks::puback(self, session, message).await,
            Packet::PublishReceived => handlers::acks::pubrec(self, session, message).await,
            Packet::Release => handlers::acks::pubrel(self, session, message).await,
            Packet::Complete => handlers::acks::pubcomp(self, session, message).await,
            Packet::Subscribe(subscribe) => {
                handlers::subscribe::subscribe(self, session, message, subscribe).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                handlers::subscribe::unsubscribe(self, session, message, unsubscribe).await
            }
            Packet::Disconnect(disconnect) => {
                handlers::disconnect::handle(self, session, disconnect.clean).await
            }
            Packet::Ping => handlers::ping::handle(self, session, message).await,
            Packet::Will => handlers::disconnect::publish_will(self, session).await,
            Packet::ConnectAck(_) | Packet::SubscribeAck(_) | Packet::UnsubscribeAck => Err(
                BrokerError::ProtocolViolation(format!("{} is server-to-client", message.packet.label())),
            ),
        }
    }

    /// Transport lost the connection: treat as a dirty disconnect.
    pub async fn on_connection_closed(
        &self,
        connection_id: &str,
        session_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let session = match session_id {
            Some(id) => self.sessions.close(id),
            None => self.sessions.close_connection(connection_id),
        };
        let Some(session) = session else {
            debug!("connection closed without session connection_id={}", connection_id);
            return Ok(());
        };
        handlers::disconnect::handle(self, &session, false).await
    }

    fn fail(&self, connection_id: &str, session: Option<&Session>, label: &str, err: &BrokerError) {
        if !err.is_fatal() {
            warn!(
                "retriable failure handling {} connection_id={} err={}",
                label, connection_id, err
            );
            return;
        }
        warn!(
            "fatal failure handling {} connection_id={} err={}",
            label, connection_id, err
        );
        let route = match session {
            Some(session) => session.route.clone(),
            None => self.local_route(connection_id),
        };
        self.close_connection(route);
    }

    /// Route for a connection of this node with no session yet.
    pub(crate) fn local_route(&self, connection_id: &str) -> Route {
        Route {
            connection_id: connection_id.to_string(),
            node_id: self.settings.node_id.clone(),
            cluster: self.settings.cluster.clone(),
            ..Route::default()
        }
    }

    /// Ask the transport to close the connection addressed by `route`.
    pub(crate) fn close_connection(&self, route: Route) {
        let message = Message::new(
            Header::default(),
            Packet::Disconnect(Disconnect { clean: false }),
        )
        .with_route(route);
        self.push(message);
    }

    /// Push to the transport; failures are logged, never propagated.
    pub(crate) fn push(&self, message: Message) {
        let Route {
            cluster,
            node_id,
            connection_id,
            ..
        } = message.route.clone();
        let label = message.packet.label();
        if let Err(err) = self.sink.push(&cluster, &node_id, message) {
            warn!(
                "push failed packet={} connection_id={} err={}",
                label, connection_id, err
            );
        }
    }
}
