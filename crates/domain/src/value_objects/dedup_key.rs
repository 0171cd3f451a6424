//! Transport-level identity of a request/response exchange
//!
//! A redelivered publish carries the same topic and correlation data as the
//! original, so the pair identifies the exchange regardless of payload.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::errors::DomainError;

/// Characters that are only valid in topic filters, never in a publish topic
const TOPIC_WILDCARDS: [char; 2] = ['+', '#'];

/// A concrete publish topic (no wildcards)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Create a topic, rejecting empty strings and wildcard characters
    pub fn new(topic: impl Into<String>) -> Result<Self, DomainError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(DomainError::InvalidTopic("topic must not be empty".to_string()));
        }
        if topic.contains(TOPIC_WILDCARDS) {
            return Err(DomainError::InvalidTopic(topic));
        }
        Ok(Self(topic))
    }

    /// Get the topic as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque correlation data copied from the request publish
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Bytes);

impl CorrelationId {
    /// Create a correlation id from raw correlation data
    pub fn new(data: impl Into<Bytes>) -> Result<Self, DomainError> {
        let data = data.into();
        if data.is_empty() {
            return Err(DomainError::InvalidCorrelationId(
                "correlation data must not be empty".to_string(),
            ));
        }
        Ok(Self(data))
    }

    /// Create a correlation id from a UUID, the format most invokers use
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(Bytes::copy_from_slice(uuid.as_bytes()))
    }

    /// Get the raw correlation bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Uuid::from_slice(&self.0) {
            Ok(uuid) => write!(f, "{uuid}"),
            Err(_) => {
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            },
        }
    }
}

/// Key of the deduplication index: `(topic, correlation id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    topic: Topic,
    correlation_id: CorrelationId,
}

impl DedupKey {
    /// Create a dedup key
    #[must_use]
    pub const fn new(topic: Topic, correlation_id: CorrelationId) -> Self {
        Self {
            topic,
            correlation_id,
        }
    }

    /// The request topic
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The correlation id
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.correlation_id)
    }
}
