//! Error types for the pub/sub layer.

use std::time::Duration;

use peril_protocol::ProtocolError;
use peril_transport::TransportError;

/// Errors returned by topology, publish and subscribe operations.
///
/// Nothing in this crate retries or swallows these; every one goes back to
/// the immediate caller. For a running subscription the terminal error
/// comes out of [`Subscription::wait`](crate::Subscription::wait).
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// A binding was built with an empty exchange, queue or routing key.
    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    /// Opening a channel on the connection failed.
    #[error("failed to open channel: {0}")]
    Channel(#[source] TransportError),

    /// The broker refused an exchange declaration.
    #[error("failed to declare exchange '{exchange}': {source}")]
    ExchangeDeclaration {
        exchange: String,
        source: TransportError,
    },

    /// The broker refused the queue declaration, typically because a
    /// queue with the same name exists with other flags.
    #[error("failed to declare queue '{queue}': {source}")]
    Declaration { queue: String, source: TransportError },

    /// Binding the queue failed, typically because the exchange is missing.
    #[error(
        "failed to bind queue '{queue}' to '{exchange}' under '{routing_key}': {source}"
    )]
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
        source: TransportError,
    },

    /// The outbound value could not be encoded. Nothing was sent.
    #[error("failed to encode message: {0}")]
    Encoding(#[source] ProtocolError),

    /// The broker did not accept a publish.
    #[error("failed to publish to '{exchange}' under '{routing_key}': {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        source: TransportError,
    },

    /// Registering the consumer (or its prefetch window) failed.
    #[error("failed to start consumer on '{queue}': {source}")]
    Consume { queue: String, source: TransportError },

    /// A delivery body did not decode. The subscription stopped.
    #[error("malformed message on '{queue}' (routing key '{routing_key}'): {source}")]
    Decoding {
        queue: String,
        routing_key: String,
        source: ProtocolError,
    },

    /// A handler did not return within the configured limit. The delivery
    /// was requeued and the subscription stopped.
    #[error("handler on '{queue}' did not finish within {timeout:?}")]
    HandlerTimeout { queue: String, timeout: Duration },

    /// Acknowledging or rejecting a delivery failed. The subscription
    /// stopped.
    #[error("failed to settle delivery on '{queue}': {source}")]
    Acknowledge { queue: String, source: TransportError },

    /// The delivery stream reported an error. The subscription stopped.
    #[error("delivery stream for '{queue}' failed: {source}")]
    Delivery { queue: String, source: TransportError },

    /// A broker round-trip did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The subscription task panicked or was aborted by the runtime.
    #[error("subscription on '{queue}' ended abnormally: {reason}")]
    TaskFailed { queue: String, reason: String },
}

impl PubSubError {
    /// Returns `true` for errors that end a running subscription.
    ///
    /// These are the ones an operator should alert on: the queue has no
    /// consumer until something restarts the subscription.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            Self::Decoding { .. }
                | Self::HandlerTimeout { .. }
                | Self::Acknowledge { .. }
                | Self::Delivery { .. }
                | Self::TaskFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_error() -> ProtocolError {
        let err = serde_json::from_slice::<u32>(b"nope").unwrap_err();
        ProtocolError::Decode(err)
    }

    #[test]
    fn test_fail_fast_classification() {
        let decoding = PubSubError::Decoding {
            queue: "war".into(),
            routing_key: "war.alice".into(),
            source: decode_error(),
        };
        assert!(decoding.is_fail_fast());

        let timeout = PubSubError::HandlerTimeout {
            queue: "war".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_fail_fast());

        let declaration = PubSubError::Declaration {
            queue: "war".into(),
            source: TransportError::PreconditionFailed("flags".into()),
        };
        assert!(!declaration.is_fail_fast());
        assert!(!PubSubError::InvalidBinding("empty".into()).is_fail_fast());
    }

    #[test]
    fn test_messages_name_the_resources() {
        let err = PubSubError::Binding {
            queue: "army_moves.bob".into(),
            exchange: "peril_topic".into(),
            routing_key: "army_moves.*".into(),
            source: TransportError::NotFound("no exchange".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("army_moves.bob"));
        assert!(msg.contains("peril_topic"));
        assert!(msg.contains("army_moves.*"));
    }
}
