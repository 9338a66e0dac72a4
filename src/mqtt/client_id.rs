use regex::Regex;

/// Client identifier rules applied at CONNECT.
#[derive(Debug, Clone)]
pub struct ClientIdPolicy {
    pattern: Regex,
    assigned_prefix: String,
}

/// Result of client ID validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdValidation {
    /// Client ID is valid.
    Valid,
    /// Client ID is empty; the broker assigns one for clean sessions.
    Empty,
    /// Client ID contains characters outside the allowed set.
    InvalidCharacters,
}

impl ClientIdPolicy {
    pub fn new(pattern: &str, assigned_prefix: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            assigned_prefix: assigned_prefix.into(),
        })
    }

    pub fn validate(&self, client_id: &str) -> ClientIdValidation {
        if client_id.is_empty() {
            return ClientIdValidation::Empty;
        }
        if self.pattern.is_match(client_id) {
            ClientIdValidation::Valid
        } else {
            ClientIdValidation::InvalidCharacters
        }
    }

    /// Format a store-issued sequence value as a client id.
    pub fn assigned(&self, sequence: &str) -> String {
        format!("{}-{}", self.assigned_prefix, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ClientIdPolicy {
        ClientIdPolicy::new(r"^[0-9A-Za-z_\-.:]{1,128}$", "auto").unwrap()
    }

    #[test]
    fn client_id_validation() {
        let policy = policy();
        assert_eq!(policy.validate("valid-client_123"), ClientIdValidation::Valid);
        assert_eq!(policy.validate(""), ClientIdValidation::Empty);
        assert_eq!(
            policy.validate("client with spaces"),
            ClientIdValidation::InvalidCharacters
        );
        assert_eq!(
            policy.validate(&"x".repeat(129)),
            ClientIdValidation::InvalidCharacters
        );
    }

    #[test]
    fn assigned_ids_carry_prefix() {
        assert_eq!(policy().assigned("00000007"), "auto-00000007");
    }
}
