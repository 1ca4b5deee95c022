//! Broker abstraction layer for Peril.
//!
//! Provides the [`Broker`], [`BrokerChannel`], [`DeliveryStream`] and
//! [`Delivery`] traits that abstract over an AMQP 0-9-1 message broker.
//! Everything above this crate talks to the broker only through them.
//!
//! # Feature Flags
//!
//! - `amqp` (default): RabbitMQ (or any AMQP 0-9-1 broker) via `lapin`
//! - `memory` (default): in-process broker with the same routing and
//!   acknowledgment semantics, for tests and local runs

mod error;
#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "memory")]
mod memory;

pub use error::TransportError;
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpChannel, AmqpConfig, AmqpDeliveries, AmqpDelivery};
#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryChannel, MemoryDeliveries, MemoryDelivery};

use std::fmt;
use std::future::Future;

/// Queue argument naming the exchange that rejected messages are
/// re-published to.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Opaque identifier for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes on exact routing-key equality.
    Direct,
    /// Routes on dotted routing-key patterns (`*` = one word, `#` = any).
    Topic,
    /// Routes to every bound queue, ignoring the key.
    Fanout,
}

impl ExchangeKind {
    /// The AMQP wire name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-level flags and arguments for a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection.
    pub exclusive: bool,
    /// Deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

/// What the broker reported back for a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// The queue name (server-generated if the declaration left it empty).
    pub name: String,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
    /// Active consumers at declaration time.
    pub consumer_count: u32,
}

/// An open connection to a broker.
///
/// A connection is shared by everything in the process; each user of it
/// opens its own [`BrokerChannel`].
pub trait Broker: Send + Sync + 'static {
    /// The channel type produced by this broker.
    type Channel: BrokerChannel;

    /// Opens a fresh channel on this connection.
    fn open_channel(
        &self,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Closes the connection. Every channel and consumer on it ends.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

/// A single channel: the unit that declares, publishes and consumes.
pub trait BrokerChannel: Send + Sync + 'static {
    /// The stream type returned by [`consume`](Self::consume).
    type Deliveries: DeliveryStream;

    /// Declares an exchange, or checks that an existing one matches.
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Declares a queue, or checks that an existing one matches `options`.
    fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> impl Future<Output = Result<QueueInfo, TransportError>> + Send;

    /// Binds `queue` to `exchange` under `routing_key`.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publishes one message. Resolves once the broker has accepted it.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Limits unacknowledged deliveries per consumer. 0 means unlimited.
    fn set_prefetch(
        &self,
        count: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts a manual-acknowledgment consumer on `queue`.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<Self::Deliveries, TransportError>> + Send;

    /// Closes the channel. Unsettled deliveries go back to their queues.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Deliveries for one consumer, in the order the broker sent them.
pub trait DeliveryStream: Send + 'static {
    /// The delivery type yielded by this stream.
    type Delivery: Delivery;

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the consumer's channel or connection has closed.
    fn next(
        &mut self,
    ) -> impl Future<Output = Option<Result<Self::Delivery, TransportError>>> + Send;
}

/// One delivered message awaiting its disposition.
///
/// `ack` and `reject` consume the delivery, so a delivery can be settled
/// at most once.
pub trait Delivery: Send + 'static {
    /// The raw message body.
    fn body(&self) -> &[u8];

    /// The routing key the message was published with.
    fn routing_key(&self) -> &str;

    /// `true` if the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledges the delivery, removing it from the queue.
    fn ack(self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Rejects the delivery. With `requeue` the broker redelivers it,
    /// otherwise it is dead-lettered (or dropped if the queue has no
    /// dead-letter exchange).
    fn reject(
        self,
        requeue: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_exchange_kind_wire_names() {
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
        assert_eq!(ExchangeKind::Topic.as_str(), "topic");
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }

    #[test]
    fn test_queue_options_default_is_plain_queue() {
        let opts = QueueOptions::default();
        assert!(!opts.durable);
        assert!(!opts.exclusive);
        assert!(!opts.auto_delete);
        assert_eq!(opts.dead_letter_exchange, None);
    }
}
