use crate::auth::{PermissionSet, Principal};
use crate::mqtt::{ProtocolVersion, Route};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Authenticated session opened by an accepted CONNECT.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub connection_id: String,
    pub principal: Principal,
    pub permissions: PermissionSet,
    pub clean_session: bool,
    pub protocol: ProtocolVersion,
    pub route: Route,
}

impl Session {
    pub fn partition(&self) -> &str {
        &self.principal.partition
    }

    pub fn client_id(&self) -> &str {
        &self.principal.client_id
    }
}

/// Live sessions of this node, by session id and by connection id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    by_connection: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let previous = self
            .by_connection
            .write()
            .insert(session.connection_id.clone(), session.session_id.clone());
        let mut sessions = self.sessions.write();
        if let Some(previous) = previous {
            sessions.remove(&previous);
        }
        sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn for_connection(&self, connection_id: &str) -> Option<Arc<Session>> {
        let session_id = self.by_connection.read().get(connection_id).cloned()?;
        self.get(&session_id)
    }

    pub fn close(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(session_id)?;
        let mut by_connection = self.by_connection.write();
        if by_connection.get(&removed.connection_id).map(String::as_str) == Some(session_id) {
            by_connection.remove(&removed.connection_id);
        }
        Some(removed)
    }

    pub fn close_connection(&self, connection_id: &str) -> Option<Arc<Session>> {
        let session_id = self.by_connection.read().get(connection_id).cloned()?;
        self.close(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(session_id: &str, connection_id: &str) -> Session {
        Session {
            session_id: session_id.into(),
            connection_id: connection_id.into(),
            principal: Principal {
                partition: "p1".into(),
                username: None,
                client_id: "dev1".into(),
            },
            permissions: PermissionSet::default(),
            clean_session: true,
            protocol: ProtocolVersion::V3_1_1,
            route: Route::default(),
        }
    }

    #[test]
    fn lookup_by_session_and_connection() {
        let registry = SessionRegistry::new();
        registry.open(session("s1", "c1"));
        assert_eq!(registry.get("s1").unwrap().connection_id, "c1");
        assert_eq!(registry.for_connection("c1").unwrap().session_id, "s1");
        assert!(registry.get("s2").is_none());
    }

    #[test]
    fn reopening_a_connection_replaces_its_session() {
        let registry = SessionRegistry::new();
        registry.open(session("s1", "c1"));
        registry.open(session("s2", "c1"));
        assert!(registry.get("s1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_connection_removes_both_indexes() {
        let registry = SessionRegistry::new();
        registry.open(session("s1", "c1"));
        assert!(registry.close_connection("c1").is_some());
        assert!(registry.is_empty());
        assert!(registry.for_connection("c1").is_none());
        assert!(registry.close("s1").is_none());
    }
}
