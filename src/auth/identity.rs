use crate::core::config::IdentityConfig;
use futures::future::BoxFuture;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("bad username or password")]
    BadCredentials,
    #[error("not authorized")]
    NotAuthorized,
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Account an authenticated connection acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub partition: String,
    pub username: Option<String>,
}

/// Credential and role lookup used by the CONNECT handler.
pub trait IdentityBackend: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        partition: &'a str,
        username: Option<&'a str>,
        credential: Option<&'a [u8]>,
    ) -> BoxFuture<'a, Result<Account, AuthError>>;

    /// Granted permission strings for the account.
    fn get_permissions<'a>(
        &'a self,
        partition: &'a str,
        username: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<String>, AuthError>>;
}

#[derive(Debug, Clone)]
struct StaticAccount {
    password: String,
    permissions: Vec<String>,
}

/// Identity backend backed by the `identity` section of the node config.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    accounts: HashMap<(String, String), StaticAccount>,
    allow_anonymous: bool,
    anonymous_permissions: Vec<String>,
}

impl StaticIdentity {
    pub fn from_config(cfg: &IdentityConfig) -> Self {
        let accounts = cfg
            .accounts
            .iter()
            .map(|account| {
                (
                    (account.partition.clone(), account.username.clone()),
                    StaticAccount {
                        password: account.password.clone(),
                        permissions: account.permissions.clone(),
                    },
                )
            })
            .collect();
        Self {
            accounts,
            allow_anonymous: cfg.allow_anonymous,
            anonymous_permissions: cfg.anonymous_permissions.clone(),
        }
    }

    fn check(
        &self,
        partition: &str,
        username: Option<&str>,
        credential: Option<&[u8]>,
    ) -> Result<Account, AuthError> {
        let Some(username) = username else {
            if self.allow_anonymous {
                return Ok(Account {
                    partition: partition.to_string(),
                    username: None,
                });
            }
            return Err(AuthError::NotAuthorized);
        };
        let account = self
            .accounts
            .get(&(partition.to_string(), username.to_string()))
            .ok_or(AuthError::BadCredentials)?;
        match credential {
            Some(given) if constant_time_eq(given, account.password.as_bytes()) => Ok(Account {
                partition: partition.to_string(),
                username: Some(username.to_string()),
            }),
            _ => Err(AuthError::BadCredentials),
        }
    }

    fn permissions(&self, partition: &str, username: Option<&str>) -> Vec<String> {
        match username {
            None => self.anonymous_permissions.clone(),
            Some(username) => self
                .accounts
                .get(&(partition.to_string(), username.to_string()))
                .map(|account| account.permissions.clone())
                .unwrap_or_default(),
        }
    }
}

impl IdentityBackend for StaticIdentity {
    fn authenticate<'a>(
        &'a self,
        partition: &'a str,
        username: Option<&'a str>,
        credential: Option<&'a [u8]>,
    ) -> BoxFuture<'a, Result<Account, AuthError>> {
        Box::pin(async move { self.check(partition, username, credential) })
    }

    fn get_permissions<'a>(
        &'a self,
        partition: &'a str,
        username: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<String>, AuthError>> {
        Box::pin(async move { Ok(self.permissions(partition, username)) })
    }
}

/// Byte comparison whose running time does not depend on where the inputs differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}
