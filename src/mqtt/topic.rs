//! Topic names, topic filters and subscription keys.
//!
//! Publishes are routed by expanding the topic into the set of filter strings
//! that could match it (`breakdown`) and looking those up as subscription keys,
//! rather than scanning every registered filter.

use super::message::Qos;
use std::fmt;
use thiserror::Error;

pub const SINGLE_LEVEL: &str = "+";
pub const MULTI_LEVEL: &str = "#";
pub const SEPARATOR: char = '/';
/// First-segment prefix reserved for broker-internal topics.
pub const RESERVED_PREFIX: char = '$';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic contains a NUL character")]
    Nul,
    #[error("topic name contains wildcard characters")]
    Wildcard,
    #[error("topic uses the reserved `$` prefix")]
    Reserved,
    #[error("topic filter has a misplaced wildcard")]
    MisplacedWildcard,
}

/// Validate a topic name carried by an inbound PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::Nul);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::Wildcard);
    }
    if topic.starts_with(RESERVED_PREFIX) {
        return Err(TopicError::Reserved);
    }
    Ok(())
}

/// Validate a subscription filter: `+` fills a whole level, `#` only as the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::Nul);
    }
    let levels: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL || idx != last) {
            return Err(TopicError::MisplacedWildcard);
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(TopicError::MisplacedWildcard);
        }
    }
    Ok(())
}

/// Expand a topic into every filter string that routes to it.
///
/// For an N-level topic this yields the literal topic, the N variants with a
/// single level replaced by `+`, and the N prefixes (lengths 0..N) followed by
/// `#`: 2N+1 candidates in total.
pub fn breakdown(topic: &str) -> Vec<String> {
    let levels: Vec<&str> = topic.split(SEPARATOR).collect();
    let mut out = Vec::with_capacity(levels.len() * 2 + 1);
    out.push(topic.to_string());
    for idx in 0..levels.len() {
        let mut variant = levels.clone();
        variant[idx] = SINGLE_LEVEL;
        out.push(variant.join("/"));
    }
    for len in 0..levels.len() {
        if len == 0 {
            out.push(MULTI_LEVEL.to_string());
        } else {
            out.push(format!("{}/{MULTI_LEVEL}", levels[..len].join("/")));
        }
    }
    out
}

/// Identity of a subscription record: `partition/qos/topicFilter`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    pub partition: String,
    pub qos: Qos,
    pub filter: String,
}

impl SubscriptionKey {
    pub fn new(partition: impl Into<String>, qos: Qos, filter: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            qos,
            filter: filter.into(),
        }
    }

    /// Candidate keys for a publish: every breakdown filter in every QoS bucket.
    pub fn candidates(partition: &str, topic: &str) -> Vec<SubscriptionKey> {
        let filters = breakdown(topic);
        let mut keys = Vec::with_capacity(filters.len() * Qos::ALL.len());
        for qos in Qos::ALL {
            for filter in &filters {
                keys.push(SubscriptionKey::new(partition, qos, filter.clone()));
            }
        }
        keys
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.partition, self.qos.as_u8(), self.filter)
    }
}
