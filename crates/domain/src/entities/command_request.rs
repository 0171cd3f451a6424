//! Command request - the identifying parts of an incoming RPC request

use bytes::Bytes;

use crate::value_objects::{
    CommandName, CorrelationId, DedupKey, InvokerId, PayloadDigest, ReuseKey, Topic,
};

/// An incoming command request, as seen by the response cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command the request targets
    pub command_name: CommandName,
    /// Client id of the invoker
    pub invoker_id: InvokerId,
    /// Topic the request was published on
    pub topic: Topic,
    /// Correlation data of the request
    pub correlation_id: CorrelationId,
    /// Serialized request payload
    pub payload: Bytes,
    /// User properties attached to the request
    pub user_properties: Vec<(String, String)>,
}

impl CommandRequest {
    /// Create a command request
    #[must_use]
    pub fn new(
        command_name: CommandName,
        invoker_id: InvokerId,
        topic: Topic,
        correlation_id: CorrelationId,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            command_name,
            invoker_id,
            topic,
            correlation_id,
            payload: payload.into(),
            user_properties: Vec::new(),
        }
    }

    /// Attach a user property
    #[must_use]
    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Digest identifying equivalent requests: payload plus user properties
    #[must_use]
    pub fn request_digest(&self) -> PayloadDigest {
        PayloadDigest::of_request(&self.payload, &self.user_properties)
    }

    /// Key of the deduplication index for this request
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.topic.clone(), self.correlation_id.clone())
    }

    /// Key of the reuse index for this request
    #[must_use]
    pub fn reuse_key(&self, can_reuse_across_invokers: bool) -> ReuseKey {
        ReuseKey::for_lookup(
            self.command_name.clone(),
            self.request_digest(),
            &self.invoker_id,
            can_reuse_across_invokers,
        )
    }
}
