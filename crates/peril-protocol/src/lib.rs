//! Wire protocol for Peril.
//!
//! This crate defines what travels inside a broker message:
//!
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how values become
//!   message bodies and back.
//! - **Routing** ([`routing`]): exchange names, routing keys and queue
//!   names shared by the server and every client.
//! - **Types** ([`PlayingState`], [`ArmyMove`], [`RecognitionOfWar`],
//!   [`GameLog`], ...): the payloads themselves.
//! - **Errors** ([`ProtocolError`]): what can go wrong while encoding or
//!   decoding.
//!
//! It knows nothing about brokers or connections; the pub/sub layer hands
//! it bytes and gets values back.

mod codec;
mod error;
pub mod routing;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ArmyMove, GameLog, Location, Player, PlayingState, RecognitionOfWar, Unit,
    UnitRank,
};
