//! Wildcard permissions of the form `type:seg1/seg2/.../segN`.
//!
//! A granted permission implies a required one when the types agree and every
//! segment of the required permission is covered by the granted segment at the
//! same position: the literal itself, `+`, `#`, or a `%u`/`%p`/`%c` token bound
//! to the principal performing the check. A granted permission that runs out of
//! segments covers everything below it.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PUBLISH: &str = "PUBLISH";
pub const SUBSCRIBE: &str = "SUBSCRIBE";

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";
const TOKEN_USERNAME: &str = "%u";
const TOKEN_PARTITION: &str = "%p";
const TOKEN_CLIENT_ID: &str = "%c";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("permission `{0}` has no `type:` prefix")]
    MissingType(String),
    #[error("permission `{0}` has an empty type")]
    EmptyType(String),
}

/// Identity the substitution tokens bind to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub partition: String,
    pub username: Option<String>,
    pub client_id: String,
}

impl Principal {
    fn resolve(&self, token: &str) -> Option<&str> {
        match token {
            TOKEN_USERNAME => self.username.as_deref(),
            TOKEN_PARTITION => Some(self.partition.as_str()),
            TOKEN_CLIENT_ID => Some(self.client_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    kind: String,
    parts: Vec<String>,
}

impl Permission {
    pub fn new(kind: impl Into<String>, path: &str) -> Self {
        Self {
            kind: kind.into(),
            parts: path.split('/').map(str::to_string).collect(),
        }
    }

    pub fn publish(topic: &str) -> Self {
        Self::new(PUBLISH, topic)
    }

    pub fn subscribe(filter: &str) -> Self {
        Self::new(SUBSCRIBE, filter)
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, path) = value
            .split_once(':')
            .ok_or_else(|| PermissionError::MissingType(value.to_string()))?;
        if kind.trim().is_empty() {
            return Err(PermissionError::EmptyType(value.to_string()));
        }
        Ok(Self::new(kind.trim(), path))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.parts.join("/"))
    }
}

fn same(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.chars()
            .flat_map(char::to_lowercase)
            .eq(b.chars().flat_map(char::to_lowercase))
    }
}

/// Whether `granted` implies `required` for `principal`.
pub fn implies(
    granted: &Permission,
    required: &Permission,
    principal: &Principal,
    case_sensitive: bool,
) -> bool {
    if !same(&granted.kind, &required.kind, case_sensitive) {
        return false;
    }
    for (idx, wanted) in required.parts.iter().enumerate() {
        let Some(have) = granted.parts.get(idx) else {
            return true;
        };
        if same(have, wanted, case_sensitive) {
            continue;
        }
        match have.as_str() {
            SINGLE_LEVEL | MULTI_LEVEL => continue,
            TOKEN_USERNAME | TOKEN_PARTITION | TOKEN_CLIENT_ID => {
                match principal.resolve(have) {
                    Some(bound) if same(bound, wanted, case_sensitive) => continue,
                    _ => return false,
                }
            }
            _ => return false,
        }
    }
    granted.parts[required.parts.len().min(granted.parts.len())..]
        .iter()
        .all(|part| part == MULTI_LEVEL)
}

/// Resolved permission set of one principal.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    granted: Vec<Permission>,
    case_sensitive: bool,
}

impl PermissionSet {
    pub fn new(granted: Vec<Permission>, case_sensitive: bool) -> Self {
        Self {
            granted,
            case_sensitive,
        }
    }

    /// Parse permission strings; a malformed entry fails the whole set.
    pub fn parse<'a>(
        raw: impl IntoIterator<Item = &'a str>,
        case_sensitive: bool,
    ) -> Result<Self, PermissionError> {
        let granted = raw
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<Permission>, _>>()?;
        Ok(Self::new(granted, case_sensitive))
    }

    pub fn permits(&self, required: &Permission, principal: &Principal) -> bool {
        self.granted
            .iter()
            .any(|granted| implies(granted, required, principal, self.case_sensitive))
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Permission {
        s.parse().unwrap()
    }

    fn principal() -> Principal {
        Principal {
            partition: "p1".into(),
            username: Some("alice".into()),
            client_id: "dev1".into(),
        }
    }

    fn check(granted: &str, required: &str) -> bool {
        implies(&p(granted), &p(required), &principal(), false)
    }

    #[test]
    fn reflexive() {
        for perm in [
            "PUBLISH:a/b/c",
            "SUBSCRIBE:sensors/+/temp",
            "SUBSCRIBE:#",
            "PUBLISH:%p/%c/out",
            "PUBLISH:",
        ] {
            assert!(check(perm, perm), "{perm}");
        }
    }

    #[test]
    fn types_must_match() {
        assert!(!check("PUBLISH:a/b", "SUBSCRIBE:a/b"));
        assert!(check("publish:a/b", "PUBLISH:a/b"));
    }

    #[test]
    fn shorter_grant_covers_remainder() {
        assert!(check("PUBLISH:a", "PUBLISH:a/b/c"));
        assert!(!check("PUBLISH:x", "PUBLISH:a/b/c"));
    }

    #[test]
    fn wildcards_accept_any_segment() {
        assert!(check("PUBLISH:a/+/c", "PUBLISH:a/b/c"));
        assert!(check("PUBLISH:a/#", "PUBLISH:a/b/c"));
        assert!(check("SUBSCRIBE:sensors/#", "SUBSCRIBE:sensors/+"));
        assert!(!check("SUBSCRIBE:sensors/temp", "SUBSCRIBE:sensors/+"));
    }

    #[test]
    fn trailing_segments_must_be_multi_level() {
        assert!(check("PUBLISH:a/b/#", "PUBLISH:a/b"));
        assert!(check("PUBLISH:a/b/#/#", "PUBLISH:a/b"));
        assert!(!check("PUBLISH:a/b/+", "PUBLISH:a/b"));
        assert!(!check("PUBLISH:a/b/c", "PUBLISH:a/b"));
    }

    #[test]
    fn tokens_bind_to_principal() {
        assert!(check("PUBLISH:%p/%c/%u", "PUBLISH:p1/dev1/alice"));
        assert!(!check("PUBLISH:%p/%c", "PUBLISH:p2/dev1"));
        assert!(!check("PUBLISH:%c", "PUBLISH:dev2"));
        let anonymous = Principal {
            username: None,
            ..principal()
        };
        assert!(!implies(
            &p("PUBLISH:%u/x"),
            &p("PUBLISH:alice/x"),
            &anonymous,
            false
        ));
    }

    #[test]
    fn wildcard_positions_accept_any_literal() {
        let grant = p("PUBLISH:a/+/#");
        for middle in ["b", "zz", "x-y"] {
            for tail in ["c", "c/d", "e/f/g"] {
                let required = Permission::publish(&format!("a/{middle}/{tail}"));
                assert!(implies(&grant, &required, &principal(), false));
            }
        }
    }

    #[test]
    fn case_sensitivity_is_configurable() {
        let principal = principal();
        assert!(implies(
            &p("PUBLISH:Sensors/Temp"),
            &p("PUBLISH:sensors/temp"),
            &principal,
            false
        ));
        assert!(!implies(
            &p("PUBLISH:Sensors/Temp"),
            &p("PUBLISH:sensors/temp"),
            &principal,
            true
        ));
        assert!(implies(
            &p("PUBLISH:%p/x"),
            &p("PUBLISH:P1/x"),
            &principal,
            false
        ));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            "sensors/temp".parse::<Permission>(),
            Err(PermissionError::MissingType("sensors/temp".into()))
        );
        assert!(matches!(
            ":a/b".parse::<Permission>(),
            Err(PermissionError::EmptyType(_))
        ));
    }

    #[test]
    fn set_permits_any_grant() {
        let set = PermissionSet::parse(["PUBLISH:a/#", "SUBSCRIBE:%p/#"], false).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.permits(&Permission::publish("a/b"), &principal()));
        assert!(set.permits(&Permission::subscribe("p1/x/+"), &principal()));
        assert!(!set.permits(&Permission::subscribe("p2/x"), &principal()));
    }
}
