//! Identity of semantically-equivalent idempotent requests

use std::fmt;

use crate::errors::DomainError;

/// Name of an RPC command as declared by the executor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandName(String);

impl CommandName {
    /// Create a command name, rejecting empty strings
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::InvalidCommandName(name));
        }
        Ok(Self(name))
    }

    /// Get the command name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client id of the invoker that published a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvokerId(String);

impl InvokerId {
    /// Create an invoker id, rejecting empty strings
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidInvokerId(
                "invoker id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the invoker id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User properties set by the transport rather than the invoker
///
/// Excluded from request equivalence. The source id is covered by the
/// invoker scope of the reuse key instead.
pub const EPHEMERAL_USER_PROPERTIES: [&str; 3] = ["__ts", "$partition", "__srcId"];

/// blake3 digest of a request payload
///
/// Byte-for-byte equality: payloads that differ only in encoding details
/// (key order, whitespace) produce different digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadDigest([u8; 32]);

impl PayloadDigest {
    /// Digest a request payload
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// Digest a request payload together with its user properties
    ///
    /// Property order does not matter and [`EPHEMERAL_USER_PROPERTIES`] are
    /// skipped. Without any remaining properties this equals [`Self::of`].
    #[must_use]
    pub fn of_request(payload: &[u8], user_properties: &[(String, String)]) -> Self {
        let mut properties: Vec<&(String, String)> = user_properties
            .iter()
            .filter(|(key, _)| !EPHEMERAL_USER_PROPERTIES.contains(&key.as_str()))
            .collect();
        if properties.is_empty() {
            return Self::of(payload);
        }
        properties.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        hasher.update(payload);
        for (key, value) in properties {
            // Length prefixes keep ("ab", "c") apart from ("a", "bc")
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadDigest({self})")
    }
}

impl fmt::Display for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// `(command name, payload digest)` pair shared by every invoker scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseBucket {
    /// Command the request targets
    pub command_name: CommandName,
    /// Digest of the request payload
    pub payload_digest: PayloadDigest,
}

/// Key of the reuse index
///
/// `invoker_scope` is `None` when a response may be shared across invokers
/// and pinned to the requesting invoker otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseKey {
    command_name: CommandName,
    payload_digest: PayloadDigest,
    invoker_scope: Option<InvokerId>,
}

impl ReuseKey {
    /// Build a reuse key for a request payload
    #[must_use]
    pub fn new(
        command_name: CommandName,
        request_payload: &[u8],
        invoker_scope: Option<InvokerId>,
    ) -> Self {
        Self::with_digest(command_name, PayloadDigest::of(request_payload), invoker_scope)
    }

    /// Build a reuse key from an already computed request digest
    #[must_use]
    pub const fn with_digest(
        command_name: CommandName,
        payload_digest: PayloadDigest,
        invoker_scope: Option<InvokerId>,
    ) -> Self {
        Self {
            command_name,
            payload_digest,
            invoker_scope,
        }
    }

    /// Build a key that is scoped to `invoker` unless cross-invoker reuse is allowed
    #[must_use]
    pub fn for_lookup(
        command_name: CommandName,
        payload_digest: PayloadDigest,
        invoker: &InvokerId,
        can_reuse_across_invokers: bool,
    ) -> Self {
        let scope = (!can_reuse_across_invokers).then(|| invoker.clone());
        Self::with_digest(command_name, payload_digest, scope)
    }

    /// The command name
    #[must_use]
    pub const fn command_name(&self) -> &CommandName {
        &self.command_name
    }

    /// The payload digest
    #[must_use]
    pub const fn payload_digest(&self) -> PayloadDigest {
        self.payload_digest
    }

    /// The invoker scope, if any
    #[must_use]
    pub const fn invoker_scope(&self) -> Option<&InvokerId> {
        self.invoker_scope.as_ref()
    }

    /// The scope-independent part of the key
    #[must_use]
    pub fn bucket(&self) -> ReuseBucket {
        ReuseBucket {
            command_name: self.command_name.clone(),
            payload_digest: self.payload_digest,
        }
    }

    /// Whether a record produced for `invoker` satisfies this key's scope
    #[must_use]
    pub fn admits(&self, invoker: &InvokerId) -> bool {
        self.invoker_scope.as_ref().is_none_or(|scope| scope == invoker)
    }
}

impl fmt::Display for ReuseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.invoker_scope {
            Some(scope) => write!(f, "{}:{}@{}", self.command_name, self.payload_digest, scope),
            None => write!(f, "{}:{}", self.command_name, self.payload_digest),
        }
    }
}
