//! Publish/subscribe plumbing for Peril.
//!
//! Three pieces sit on top of a [`peril_transport::Broker`]:
//!
//! - **Topology** ([`Binding`], [`QueueDurability`], [`declare_and_bind`])
//!   declares queues with consistent flags and a dead-letter exchange, and
//!   binds them to exchanges.
//! - **Publisher** ([`publish_json`]) encodes a value and sends it.
//! - **Subscription engine** ([`subscribe_json`]) consumes a queue, decodes
//!   each delivery, hands it to a [`Handler`] and turns the returned
//!   [`AckType`] into an ack, a requeue or a dead-letter.
//!
//! Every call takes its broker or channel explicitly; there is no ambient
//! connection.
//!
//! ```rust,no_run
//! use peril_protocol::PlayingState;
//! use peril_protocol::routing::{EXCHANGE_PERIL_DIRECT, PAUSE_KEY};
//! use peril_pubsub::{AckType, Binding, PubSubConfig, QueueDurability};
//! use peril_transport::MemoryBroker;
//!
//! # async fn demo() -> Result<(), peril_pubsub::PubSubError> {
//! let broker = MemoryBroker::new();
//! let config = PubSubConfig::default();
//! peril_pubsub::provision_exchanges(&broker, &config).await?;
//!
//! let binding = Binding::new(
//!     EXCHANGE_PERIL_DIRECT,
//!     "pause.alice",
//!     PAUSE_KEY,
//!     QueueDurability::Transient,
//! )?;
//! let subscription = peril_pubsub::subscribe_json(
//!     &broker,
//!     &config,
//!     &binding,
//!     |state: PlayingState| {
//!         println!("paused: {}", state.is_paused);
//!         AckType::Ack
//!     },
//! )
//! .await?;
//! subscription.wait().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod publish;
mod subscribe;
mod topology;

use std::future::Future;
use std::time::Duration;

pub use config::{DecodeFailurePolicy, PubSubConfig};
pub use error::PubSubError;
pub use handler::{AckType, AsyncHandler, Handler};
pub use publish::{publish_json, publish_with};
pub use subscribe::{Subscription, SubscriptionState, subscribe_json, subscribe_with};
pub use topology::{
    Binding, QueueDurability, declare_and_bind, declare_exchange, provision_exchanges,
};

/// Runs `fut`, giving up after `limit` if one is set.
pub(crate) async fn bounded<T, F>(
    limit: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T, PubSubError>
where
    F: Future<Output = Result<T, PubSubError>>,
{
    match limit {
        None => fut.await,
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| PubSubError::Timeout { operation, timeout })?,
    }
}
