//! Error types for the protocol layer.
//!
//! Each crate in Peril defines its own error enum. A `ProtocolError` always
//! means the bytes and the Rust type disagreed; it never means the broker
//! misbehaved.

/// Errors that can occur while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into bytes).
    ///
    /// With JSON this happens for values the format cannot represent,
    /// such as maps whose keys are not strings or numbers.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust value).
    ///
    /// Common causes: malformed JSON, missing required fields, wrong
    /// data types, or a truncated body. Decoding is all-or-nothing, so
    /// no partially built value is ever returned.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Returns `true` if the error came from decoding an inbound body.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}
