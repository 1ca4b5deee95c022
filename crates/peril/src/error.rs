//! Unified error type for Peril.

use peril_protocol::ProtocolError;
use peril_pubsub::PubSubError;
use peril_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `peril` crate you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum PerilError {
    /// A broker connection or channel error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An encode or decode error outside a subscription.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A topology, publish or subscription error.
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    /// The configuration file or environment could not be read.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl PerilError {
    /// Returns `true` if a running subscription ended because of this error.
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, Self::PubSub(e) if e.is_fail_fast())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::Closed("gone".into());
        let peril_err: PerilError = err.into();
        assert!(matches!(peril_err, PerilError::Transport(_)));
        assert!(peril_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_pubsub_error_keeps_fail_fast() {
        let err = PubSubError::HandlerTimeout {
            queue: "war".into(),
            timeout: Duration::from_secs(1),
        };
        let peril_err: PerilError = err.into();
        assert!(peril_err.is_fail_fast());

        let err: PerilError = PubSubError::InvalidBinding("empty queue".into()).into();
        assert!(!err.is_fail_fast());
    }

    #[test]
    fn test_from_config_error() {
        let err = config::ConfigError::NotFound("amqp_url".into());
        let peril_err: PerilError = err.into();
        assert!(matches!(peril_err, PerilError::Config(_)));
        assert!(peril_err.to_string().starts_with("invalid configuration"));
    }
}
