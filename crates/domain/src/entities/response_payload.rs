//! Response payload - the opaque unit a command executor publishes back

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload format indicator carried alongside the response bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormatIndicator {
    /// Unspecified bytes
    #[default]
    UnspecifiedBytes,
    /// UTF-8 encoded character data
    Utf8EncodedCharacterData,
}

/// Serialized response plus the transport metadata published with it
///
/// The cache never inspects `payload`; it only measures and clones it.
/// Cloning is cheap and yields byte-identical content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    /// Serialized response body
    pub payload: Bytes,
    /// MIME content type of `payload`
    pub content_type: String,
    /// Format indicator published with the response
    pub format_indicator: FormatIndicator,
    /// User properties published with the response
    pub user_properties: Vec<(String, String)>,
    /// Whether this is an error response (handler or protocol failure)
    pub is_error_response: bool,
}

impl ResponsePayload {
    /// Create a successful response with no user properties
    #[must_use]
    pub fn new(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            format_indicator: FormatIndicator::default(),
            user_properties: Vec::new(),
            is_error_response: false,
        }
    }

    /// Create an error response
    #[must_use]
    pub fn error(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            is_error_response: true,
            ..Self::new(payload, content_type)
        }
    }

    /// Set the format indicator
    #[must_use]
    pub const fn with_format_indicator(mut self, format_indicator: FormatIndicator) -> Self {
        self.format_indicator = format_indicator;
        self
    }

    /// Append a user property
    #[must_use]
    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Byte length of the payload body
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}
