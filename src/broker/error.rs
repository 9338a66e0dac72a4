use super::sink::SinkError;
use crate::auth::AuthError;
use crate::mqtt::ConnectReturnCode;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no authenticated session")]
    Unauthenticated,
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("client identifier rejected: {0}")]
    IdentifierRejected(String),
    #[error("unacceptable protocol {name} level {level}")]
    UnacceptableProtocol { name: String, level: u8 },
    #[error("bad username or password")]
    BadCredentials,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Fatal errors terminate the connection; the rest may be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Store(err) => !err.is_retriable(),
            BrokerError::Sink(_) => false,
            BrokerError::ProtocolViolation(_)
            | BrokerError::Unauthenticated
            | BrokerError::NotAuthorized(_)
            | BrokerError::IdentifierRejected(_)
            | BrokerError::UnacceptableProtocol { .. }
            | BrokerError::BadCredentials
            | BrokerError::Internal(_) => true,
        }
    }

    /// CONNACK return code reporting this error, if the protocol allows one.
    pub fn connack_code(&self) -> Option<ConnectReturnCode> {
        match self {
            BrokerError::ProtocolViolation(_) => None,
            BrokerError::UnacceptableProtocol { .. } => {
                Some(ConnectReturnCode::UnacceptableProtocolVersion)
            }
            BrokerError::IdentifierRejected(_) => Some(ConnectReturnCode::IdentifierRejected),
            BrokerError::BadCredentials => Some(ConnectReturnCode::BadUsernameOrPassword),
            BrokerError::NotAuthorized(_) | BrokerError::Unauthenticated => {
                Some(ConnectReturnCode::NotAuthorized)
            }
            BrokerError::Store(_) | BrokerError::Sink(_) | BrokerError::Internal(_) => {
                Some(ConnectReturnCode::ServerUnavailable)
            }
        }
    }
}

impl From<AuthError> for BrokerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::BadCredentials => BrokerError::BadCredentials,
            AuthError::NotAuthorized => BrokerError::NotAuthorized("connect".into()),
            AuthError::Unavailable(msg) => BrokerError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailability_is_retriable() {
        assert!(!BrokerError::Store(StoreError::Unavailable("down".into())).is_fatal());
        assert!(BrokerError::Store(StoreError::Corrupt("bad".into())).is_fatal());
        assert!(BrokerError::Unauthenticated.is_fatal());
        assert!(!BrokerError::Sink(SinkError::NoRoute("c1".into())).is_fatal());
    }

    #[test]
    fn connack_codes_follow_condition() {
        assert_eq!(
            BrokerError::BadCredentials.connack_code(),
            Some(ConnectReturnCode::BadUsernameOrPassword)
        );
        assert_eq!(
            BrokerError::from(AuthError::NotAuthorized).connack_code(),
            Some(ConnectReturnCode::NotAuthorized)
        );
        assert_eq!(
            BrokerError::from(AuthError::Unavailable("ldap".into())).connack_code(),
            Some(ConnectReturnCode::ServerUnavailable)
        );
        assert_eq!(
            BrokerError::ProtocolViolation("x".into()).connack_code(),
            None
        );
    }
}
