//! # Peril
//!
//! Broker-backed pub/sub for the Peril strategy game.
//!
//! The game server and every client talk only through a message broker:
//! pause signals on a direct exchange, moves, wars and log lines on a topic
//! exchange. This crate re-exports the pieces and adds process-level
//! concerns: configuration, tracing setup and a connected [`PerilClient`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peril::prelude::*;
//!
//! # async fn demo() -> Result<(), PerilError> {
//! peril::init_tracing();
//! let config = PerilConfig::load()?;
//! let client = PerilClientBuilder::from_config(&config).connect().await?;
//! client.provision().await?;
//!
//! let publisher = client.publisher().await?;
//! publisher
//!     .publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &PlayingState { is_paused: true })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod logging;
mod settings;

pub use client::{PerilClient, PerilClientBuilder, Publisher};
pub use error::PerilError;
pub use logging::{DEFAULT_FILTER, init_tracing};
pub use settings::{DEFAULT_CONFIG_FILE, ENV_PREFIX, PerilConfig};

pub use peril_protocol as protocol;
pub use peril_pubsub as pubsub;
pub use peril_transport as transport;

/// Common imports for Peril processes.
pub mod prelude {
    pub use crate::{PerilClient, PerilClientBuilder, PerilConfig, PerilError, Publisher};

    pub use peril_protocol::routing::{
        EXCHANGE_PERIL_DIRECT, EXCHANGE_PERIL_DLX, EXCHANGE_PERIL_TOPIC, PAUSE_KEY,
    };
    pub use peril_protocol::{
        ArmyMove, GameLog, Location, Player, PlayingState, RecognitionOfWar, Unit, UnitRank,
    };
    pub use peril_pubsub::{
        AckType, AsyncHandler, Binding, Handler, PubSubConfig, QueueDurability,
        Subscription, SubscriptionState,
    };
    pub use peril_transport::{AmqpBroker, Broker, MemoryBroker};
}
