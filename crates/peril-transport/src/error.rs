/// Errors that can occur in the broker layer.
///
/// Variants follow the AMQP reply classes a client actually has to react
/// to; everything else is folded into [`TransportError::Protocol`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Dialing the broker failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection is closed (by us or by the broker).
    #[error("connection closed: {0}")]
    Closed(String),

    /// The channel is closed and can no longer carry operations.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The exchange or queue named in the operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A redeclaration did not match the existing entity's properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The queue is exclusive to another connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Any other broker-reported failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}
