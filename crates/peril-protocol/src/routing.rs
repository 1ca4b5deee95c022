//! Exchange names, routing keys and queue names used by the game.
//!
//! Control-plane signals (pause/resume) go through a direct exchange under
//! a fixed key. Gameplay events go through a topic exchange under dotted
//! keys of the form `<prefix>.<username>`, so consumers can bind with a
//! wildcard such as `army_moves.*`.

/// Direct exchange for control-plane signals.
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";

/// Topic exchange for gameplay events.
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

/// Dead-letter exchange every declared queue points at.
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

/// Queue bound to [`EXCHANGE_PERIL_DLX`] that collects discarded messages.
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

/// Routing key for [`PlayingState`](crate::PlayingState) messages.
pub const PAUSE_KEY: &str = "pause";

/// Prefix for [`ArmyMove`](crate::ArmyMove) routing keys.
pub const ARMY_MOVES_PREFIX: &str = "army_moves";

/// Prefix for [`RecognitionOfWar`](crate::RecognitionOfWar) routing keys.
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";

/// Prefix for [`GameLog`](crate::GameLog) routing keys.
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Shared durable queue all clients consume war recognitions from.
pub const WAR_QUEUE: &str = WAR_RECOGNITIONS_PREFIX;

/// Durable queue the server consumes game logs from.
pub const GAME_LOG_QUEUE: &str = GAME_LOG_SLUG;

/// `<prefix>.<username>`
fn keyed(prefix: &str, username: &str) -> String {
    format!("{prefix}.{username}")
}

/// Routing key for a move published by `username`.
pub fn army_moves_key(username: &str) -> String {
    keyed(ARMY_MOVES_PREFIX, username)
}

/// Routing key for a war recognition published by `username`.
pub fn war_key(username: &str) -> String {
    keyed(WAR_RECOGNITIONS_PREFIX, username)
}

/// Routing key for a game log written by `username`.
pub fn game_log_key(username: &str) -> String {
    keyed(GAME_LOG_SLUG, username)
}

/// Binding pattern matching every `<prefix>.<username>` key.
pub fn wildcard(prefix: &str) -> String {
    keyed(prefix, "*")
}

/// Per-player transient queue for pause/resume signals.
pub fn pause_queue(username: &str) -> String {
    keyed(PAUSE_KEY, username)
}

/// Per-player transient queue for other players' moves.
pub fn army_moves_queue(username: &str) -> String {
    army_moves_key(username)
}
