//! Pub/sub configuration.

use std::time::Duration;

use peril_protocol::routing::EXCHANGE_PERIL_DLX;
use serde::Deserialize;
use tracing::warn;

/// What a subscription does with a delivery whose body does not decode.
///
/// In both cases the subscription stops afterwards; the policy only
/// decides where the malformed message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Reject without requeue, so the broker routes the message to the
    /// dead-letter exchange where it can be inspected. A restarted
    /// subscription does not see it again.
    #[default]
    DeadLetter,
    /// Reject with requeue. The message stays at the head of the queue,
    /// so a restarted subscription hits it again. Only useful when the
    /// fix is a consumer upgrade that can decode it.
    Requeue,
}

impl DecodeFailurePolicy {
    /// Whether the malformed delivery goes back to its queue.
    pub fn requeues(self) -> bool {
        matches!(self, Self::Requeue)
    }
}

/// Settings shared by every publish and subscribe call of a process.
///
/// The dead-letter exchange is deliberately here and not on individual
/// calls: every queue declared through this crate gets the same one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Exchange that rejected-without-requeue messages are routed to.
    pub dead_letter_exchange: String,
    /// Unacknowledged deliveries a consumer may hold. 0 = broker default
    /// (unlimited).
    pub prefetch_count: u16,
    /// Upper bound on a single handler invocation. `None` = unbounded.
    ///
    /// This is the consumer-liveness limit: a handler that cannot decide
    /// within it has its delivery requeued and its subscription stopped.
    pub handler_timeout: Option<Duration>,
    /// Upper bound on each broker round-trip (channel open, declare, bind,
    /// consume, publish). `None` = unbounded.
    pub operation_timeout: Option<Duration>,
    /// Disposition of deliveries that fail to decode.
    pub decode_failure: DecodeFailurePolicy,
    /// Prefix for generated consumer tags.
    pub consumer_tag_prefix: String,
}

impl PubSubConfig {
    /// Default [`handler_timeout`](Self::handler_timeout).
    pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default [`operation_timeout`](Self::operation_timeout).
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default [`consumer_tag_prefix`](Self::consumer_tag_prefix).
    pub const DEFAULT_CONSUMER_TAG_PREFIX: &'static str = "peril";

    /// Fix any out-of-range values so the config is safe to use.
    ///
    /// Called by the facade before handing the config out. Rules:
    /// - an empty dead-letter exchange falls back to `peril_dlx`;
    /// - a zero timeout would expire immediately, so it falls back to the
    ///   default;
    /// - an empty consumer tag prefix falls back to `peril`.
    pub fn validated(mut self) -> Self {
        if self.dead_letter_exchange.is_empty() {
            warn!("dead_letter_exchange is empty, using {EXCHANGE_PERIL_DLX}");
            self.dead_letter_exchange = EXCHANGE_PERIL_DLX.to_string();
        }
        if self.handler_timeout == Some(Duration::ZERO) {
            warn!("handler_timeout of zero, using the default");
            self.handler_timeout = Some(Self::DEFAULT_HANDLER_TIMEOUT);
        }
        if self.operation_timeout == Some(Duration::ZERO) {
            warn!("operation_timeout of zero, using the default");
            self.operation_timeout = Some(Self::DEFAULT_OPERATION_TIMEOUT);
        }
        if self.consumer_tag_prefix.is_empty() {
            self.consumer_tag_prefix = Self::DEFAULT_CONSUMER_TAG_PREFIX.to_string();
        }
        self
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            dead_letter_exchange: EXCHANGE_PERIL_DLX.to_string(),
            prefetch_count: 0,
            handler_timeout: Some(Self::DEFAULT_HANDLER_TIMEOUT),
            operation_timeout: Some(Self::DEFAULT_OPERATION_TIMEOUT),
            decode_failure: DecodeFailurePolicy::default(),
            consumer_tag_prefix: Self::DEFAULT_CONSUMER_TAG_PREFIX.to_string(),
        }
    }
}
