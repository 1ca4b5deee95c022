//! Codec trait and implementations for message bodies.
//!
//! A "codec" (coder/decoder) converts between Rust values and the raw bytes
//! carried in a broker message body. The pub/sub layer never touches
//! `serde_json` directly; it goes through a [`Codec`], so the body format
//! can change without touching publish or subscribe code.
//!
//! The game speaks JSON on the wire, so [`JsonCodec`] is the only codec
//! shipped today.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust values to bytes and decode bytes back.
///
/// ## Trait bounds
///
/// - `Send + Sync` → one codec value is shared by every subscription task.
/// - `'static` → codecs own everything they need, so they can live inside
///   a spawned consumer loop.
///
/// `decode` asks for `DeserializeOwned` rather than `Deserialize<'de>`:
/// the decoded value must not borrow from the delivery body, because the
/// delivery is settled (and its buffer dropped) after the handler returns.
pub trait Codec: Send + Sync + 'static {
    /// MIME type stamped on published messages.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into a message body.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value cannot be represented
    /// in this format.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes a message body into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or do not
    /// match the shape of `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses UTF-8 JSON (via `serde_json`), one document per
/// message body.
///
/// ## Example
///
/// ```rust
/// use peril_protocol::{Codec, JsonCodec, PlayingState};
///
/// let codec = JsonCodec;
///
/// let bytes = codec.encode(&PlayingState { is_paused: true }).unwrap();
/// assert_eq!(bytes, br#"{"IsPaused":true}"#);
///
/// let decoded: PlayingState = codec.decode(&bytes).unwrap();
/// assert!(decoded.is_paused);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// The content type used for every JSON body.
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
