//! Queue declaration and binding.
//!
//! Every queue this crate creates goes through [`declare_and_bind`], which
//! derives the broker flags from a single [`QueueDurability`] value and
//! attaches the configured dead-letter exchange.

use std::fmt;

use peril_protocol::routing::{
    DEAD_LETTER_QUEUE, EXCHANGE_PERIL_DIRECT, EXCHANGE_PERIL_TOPIC,
};
use peril_transport::{Broker, BrokerChannel, ExchangeKind, QueueInfo, QueueOptions};

use crate::{PubSubConfig, PubSubError, bounded};

// ---------------------------------------------------------------------------
// QueueDurability
// ---------------------------------------------------------------------------

/// How long a queue lives.
///
/// One value sets three broker flags together. There is no way to ask
/// for, say, a durable exclusive queue through this crate.
///
/// | class       | durable | exclusive | auto-delete |
/// |-------------|---------|-----------|-------------|
/// | `Durable`   | yes     | no        | no          |
/// | `Transient` | no      | yes       | yes         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDurability {
    /// Survives broker restarts and consumer disconnects; shareable.
    Durable,
    /// Private to the declaring connection; gone with its last consumer.
    Transient,
}

impl QueueDurability {
    /// Whether the queue survives a broker restart.
    pub fn durable(self) -> bool {
        matches!(self, Self::Durable)
    }

    /// Whether the queue is private to the declaring connection.
    pub fn exclusive(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether the queue is deleted when its last consumer goes away.
    pub fn auto_delete(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// The full declaration options for this class.
    pub fn queue_options(self, dead_letter_exchange: &str) -> QueueOptions {
        QueueOptions {
            durable: self.durable(),
            exclusive: self.exclusive(),
            auto_delete: self.auto_delete(),
            dead_letter_exchange: Some(dead_letter_exchange.to_string()),
        }
    }
}

impl fmt::Display for QueueDurability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::Transient => f.write_str("transient"),
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Where a queue lives and what it receives: `(exchange, queue,
/// routing key, durability)`.
///
/// Built once, immutable afterwards. The broker owns the resulting queue's
/// lifetime; nothing in this crate deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
    durability: QueueDurability,
}

impl Binding {
    /// Creates a binding.
    ///
    /// # Errors
    /// Returns [`PubSubError::InvalidBinding`] if the exchange, queue or
    /// routing key is empty.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        durability: QueueDurability,
    ) -> Result<Self, PubSubError> {
        let binding = Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            durability,
        };
        for (what, value) in [
            ("exchange", &binding.exchange),
            ("queue", &binding.queue),
            ("routing key", &binding.routing_key),
        ] {
            if value.is_empty() {
                return Err(PubSubError::InvalidBinding(format!(
                    "{what} must not be empty"
                )));
            }
        }
        Ok(binding)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn durability(&self) -> QueueDurability {
        self.durability
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <- {} [{}] ({})",
            self.queue, self.exchange, self.routing_key, self.durability
        )
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Opens a channel, declares the binding's queue and binds it.
///
/// The queue gets the flags of its [`QueueDurability`] and the config's
/// dead-letter exchange. On success the caller owns the channel; on
/// failure it has already been closed, so nothing half-built is left
/// behind on this side.
///
/// # Errors
/// - [`PubSubError::Channel`] if no channel could be opened;
/// - [`PubSubError::Declaration`] if the broker refused the queue;
/// - [`PubSubError::Binding`] if the bind failed;
/// - [`PubSubError::Timeout`] if a round-trip exceeded
///   `config.operation_timeout`.
pub async fn declare_and_bind<B: Broker>(
    broker: &B,
    config: &PubSubConfig,
    binding: &Binding,
) -> Result<(B::Channel, QueueInfo), PubSubError> {
    let channel = bounded(config.operation_timeout, "channel open", async {
        broker.open_channel().await.map_err(PubSubError::Channel)
    })
    .await?;

    match declare_on(&channel, config, binding).await {
        Ok(queue) => Ok((channel, queue)),
        Err(e) => {
            close_quietly(&channel).await;
            Err(e)
        }
    }
}

async fn declare_on<C: BrokerChannel>(
    channel: &C,
    config: &PubSubConfig,
    binding: &Binding,
) -> Result<QueueInfo, PubSubError> {
    let options = binding
        .durability()
        .queue_options(&config.dead_letter_exchange);

    let queue = bounded(config.operation_timeout, "queue declare", async {
        channel
            .declare_queue(binding.queue(), &options)
            .await
            .map_err(|source| PubSubError::Declaration {
                queue: binding.queue().to_string(),
                source,
            })
    })
    .await?;

    bounded(config.operation_timeout, "queue bind", async {
        channel
            .bind_queue(&queue.name, binding.exchange(), binding.routing_key())
            .await
            .map_err(|source| PubSubError::Binding {
                queue: queue.name.clone(),
                exchange: binding.exchange().to_string(),
                routing_key: binding.routing_key().to_string(),
                source,
            })
    })
    .await?;

    tracing::debug!(
        queue = %queue.name,
        exchange = binding.exchange(),
        routing_key = binding.routing_key(),
        durability = %binding.durability(),
        "declared and bound queue"
    );
    Ok(queue)
}

/// Closes a channel we are abandoning. The caller already has the error
/// that matters.
pub(crate) async fn close_quietly<C: BrokerChannel>(channel: &C) {
    if let Err(e) = channel.close().await {
        tracing::debug!(error = %e, "channel close failed");
    }
}

/// Declares a durable exchange on `channel`.
pub async fn declare_exchange<C: BrokerChannel>(
    channel: &C,
    config: &PubSubConfig,
    name: &str,
    kind: ExchangeKind,
) -> Result<(), PubSubError> {
    bounded(config.operation_timeout, "exchange declare", async {
        channel.declare_exchange(name, kind, true).await.map_err(|source| {
            PubSubError::ExchangeDeclaration {
                exchange: name.to_string(),
                source,
            }
        })
    })
    .await
}

/// Provisions the game's exchanges and the dead-letter queue.
///
/// Declares `peril_direct` (direct), `peril_topic` (topic), the config's
/// dead-letter exchange (fanout) and a durable `peril_dlq` bound to it.
/// Production brokers are usually provisioned out-of-band; this is for
/// fresh local brokers and tests. Safe to call repeatedly.
pub async fn provision_exchanges<B: Broker>(
    broker: &B,
    config: &PubSubConfig,
) -> Result<(), PubSubError> {
    let channel = bounded(config.operation_timeout, "channel open", async {
        broker.open_channel().await.map_err(PubSubError::Channel)
    })
    .await?;

    let result = provision_on(&channel, config).await;
    close_quietly(&channel).await;
    result
}

async fn provision_on<C: BrokerChannel>(
    channel: &C,
    config: &PubSubConfig,
) -> Result<(), PubSubError> {
    let dlx = config.dead_letter_exchange.as_str();
    declare_exchange(channel, config, EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct)
        .await?;
    declare_exchange(channel, config, EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic)
        .await?;
    declare_exchange(channel, config, dlx, ExchangeKind::Fanout).await?;

    // The dead-letter queue itself has no dead-letter exchange.
    let options = QueueOptions {
        dead_letter_exchange: None,
        ..QueueDurability::Durable.queue_options(dlx)
    };
    bounded(config.operation_timeout, "queue declare", async {
        channel
            .declare_queue(DEAD_LETTER_QUEUE, &options)
            .await
            .map_err(|source| PubSubError::Declaration {
                queue: DEAD_LETTER_QUEUE.to_string(),
                source,
            })
    })
    .await?;
    bounded(config.operation_timeout, "queue bind", async {
        channel
            .bind_queue(DEAD_LETTER_QUEUE, dlx, "")
            .await
            .map_err(|source| PubSubError::Binding {
                queue: DEAD_LETTER_QUEUE.to_string(),
                exchange: dlx.to_string(),
                routing_key: String::new(),
                source,
            })
    })
    .await?;

    tracing::info!(dlx, "provisioned peril exchanges");
    Ok(())
}

#[cfg(test)]
mod tests {
    use peril_protocol::routing::EXCHANGE_PERIL_DLX;
    use peril_transport::{MemoryBroker, TransportError};

    use super::*;

    #[test]
    fn test_durable_flag_mapping() {
        let d = QueueDurability::Durable;
        assert_eq!((d.durable(), d.exclusive(), d.auto_delete()), (true, false, false));
    }

    #[test]
    fn test_transient_flag_mapping() {
        let t = QueueDurability::Transient;
        assert_eq!((t.durable(), t.exclusive(), t.auto_delete()), (false, true, true));
    }

    #[test]
    fn test_queue_options_always_carry_dead_letter_exchange() {
        for class in [QueueDurability::Durable, QueueDurability::Transient] {
            let opts = class.queue_options("peril_dlx");
            assert_eq!(opts.dead_letter_exchange.as_deref(), Some("peril_dlx"));
            assert_eq!(opts.durable, class.durable());
            assert_eq!(opts.exclusive, class.exclusive());
            assert_eq!(opts.auto_delete, class.auto_delete());
        }
    }

    #[test]
    fn test_binding_rejects_empty_parts() {
        let cases = [
            ("", "q", "k"),
            ("ex", "", "k"),
            ("ex", "q", ""),
        ];
        for (exchange, queue, key) in cases {
            let result = Binding::new(exchange, queue, key, QueueDurability::Durable);
            assert!(matches!(result, Err(PubSubError::InvalidBinding(_))));
        }
    }

    #[test]
    fn test_binding_accessors_and_display() {
        let b = Binding::new("peril_topic", "war", "war.*", QueueDurability::Durable)
            .unwrap();
        assert_eq!(b.exchange(), "peril_topic");
        assert_eq!(b.queue(), "war");
        assert_eq!(b.routing_key(), "war.*");
        assert_eq!(b.durability(), QueueDurability::Durable);
        assert_eq!(b.to_string(), "war <- peril_topic [war.*] (durable)");
    }

    #[tokio::test]
    async fn test_declare_and_bind_creates_bound_queue() {
        let broker = MemoryBroker::new();
        let config = PubSubConfig::default();
        provision_exchanges(&broker, &config).await.unwrap();

        let binding =
            Binding::new(EXCHANGE_PERIL_TOPIC, "war", "war.*", QueueDurability::Durable)
                .unwrap();
        let (channel, queue) = declare_and_bind(&broker, &config, &binding)
            .await
            .unwrap();
        assert_eq!(queue.name, "war");

        channel
            .publish(EXCHANGE_PERIL_TOPIC, "war.alice", b"{}", "application/json")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("war"), Some(1));
    }

    #[tokio::test]
    async fn test_incompatible_redeclaration_is_declaration_error() {
        let broker = MemoryBroker::new();
        let config = PubSubConfig::default();
        provision_exchanges(&broker, &config).await.unwrap();

        let durable =
            Binding::new(EXCHANGE_PERIL_TOPIC, "war", "war.*", QueueDurability::Durable)
                .unwrap();
        declare_and_bind(&broker, &config, &durable).await.unwrap();

        let transient =
            Binding::new(EXCHANGE_PERIL_TOPIC, "war", "war.*", QueueDurability::Transient)
                .unwrap();
        let err = declare_and_bind(&broker, &config, &transient)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PubSubError::Declaration {
                source: TransportError::PreconditionFailed(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_exchange_is_binding_error() {
        let broker = MemoryBroker::new();
        let config = PubSubConfig::default();
        let binding =
            Binding::new("nowhere", "war", "war.*", QueueDurability::Durable).unwrap();
        let err = declare_and_bind(&broker, &config, &binding)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PubSubError::Binding {
                source: TransportError::NotFound(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent_and_wires_dead_letters() {
        let broker = MemoryBroker::new();
        let config = PubSubConfig::default();
        provision_exchanges(&broker, &config).await.unwrap();
        provision_exchanges(&broker, &config).await.unwrap();

        let channel = broker.open_channel().await.unwrap();
        channel
            .publish(EXCHANGE_PERIL_DLX, "anything", b"x", "text/plain")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth(DEAD_LETTER_QUEUE), Some(1));
    }

    #[tokio::test]
    async fn test_closed_connection_is_channel_error() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let binding =
            Binding::new("peril_topic", "war", "war.*", QueueDurability::Durable).unwrap();
        let err = declare_and_bind(&broker, &PubSubConfig::default(), &binding)
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Channel(TransportError::Closed(_))));
    }
}
