//! Message payloads that travel between the game server and clients.
//!
//! These are plain data: the pub/sub layer only encodes and decodes them.
//! What a move or a war *means* is decided by the game rules, which live
//! outside this workspace.
//!
//! Field names are PascalCase on the wire (`{"IsPaused":true}`), which is
//! the format every existing Peril client already speaks.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

/// Pause/resume signal broadcast by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// A continent on the game board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Americas,
    Europe,
    Africa,
    Asia,
    Antarctica,
    Australia,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Americas => "americas",
            Self::Europe => "europe",
            Self::Africa => "africa",
            Self::Asia => "asia",
            Self::Antarctica => "antarctica",
            Self::Australia => "australia",
        };
        f.write_str(name)
    }
}

/// The kind of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRank {
    Infantry,
    Cavalry,
    Artillery,
}

/// One unit on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Unit {
    #[serde(rename = "ID")]
    pub id: u32,
    pub rank: UnitRank,
    pub location: Location,
}

/// A snapshot of a player and their units, keyed by unit ID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Player {
    pub username: String,
    pub units: BTreeMap<u32, Unit>,
}

// ---------------------------------------------------------------------------
// Gameplay events
// ---------------------------------------------------------------------------

/// A player moved some of their units. Published under
/// `army_moves.<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArmyMove {
    pub player: Player,
    pub units: Vec<Unit>,
    pub to_location: Location,
}

/// A move ran into an enemy and war was declared. Published under
/// `war.<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionOfWar {
    pub attacker: Player,
    pub defender: Player,
}

/// A line for the server's game log. Published under
/// `game_logs.<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn alice() -> Player {
        let mut units = BTreeMap::new();
        units.insert(
            1,
            Unit {
                id: 1,
                rank: UnitRank::Infantry,
                location: Location::Europe,
            },
        );
        Player {
            username: "alice".into(),
            units,
        }
    }

    #[test]
    fn test_playing_state_wire_format() {
        let json = serde_json::to_string(&PlayingState { is_paused: true }).unwrap();
        assert_eq!(json, r#"{"IsPaused":true}"#);
    }

    #[test]
    fn test_playing_state_rejects_snake_case() {
        let result = serde_json::from_str::<PlayingState>(r#"{"is_paused":true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unit_uses_upper_case_id_field() {
        let unit = Unit {
            id: 3,
            rank: UnitRank::Cavalry,
            location: Location::Asia,
        };
        let json = serde_json::to_string(&unit).unwrap();
        assert_eq!(json, r#"{"ID":3,"Rank":"cavalry","Location":"asia"}"#);
    }

    #[test]
    fn test_player_units_keyed_by_stringified_id() {
        // JSON object keys are strings; integer unit IDs survive the trip.
        let json = serde_json::to_value(alice()).unwrap();
        assert_eq!(json["Units"]["1"]["Location"], "europe");

        let back: Player = serde_json::from_value(json).unwrap();
        assert_eq!(back, alice());
    }

    #[test]
    fn test_army_move_json_shape() {
        let mv = ArmyMove {
            player: alice(),
            units: alice().units.into_values().collect(),
            to_location: Location::Africa,
        };
        let json = serde_json::to_value(&mv).unwrap();
        assert_eq!(json["Player"]["Username"], "alice");
        assert_eq!(json["ToLocation"], "africa");
        assert_eq!(json["Units"][0]["Rank"], "infantry");
    }

    #[test]
    fn test_unknown_location_is_a_decode_error() {
        let body = r#"{"ID":1,"Rank":"infantry","Location":"atlantis"}"#;
        assert!(serde_json::from_str::<Unit>(body).is_err());
    }

    #[test]
    fn test_game_log_time_is_rfc3339() {
        let log = GameLog {
            current_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            message: "alice won a war against bob".into(),
            username: "alice".into(),
        };
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["CurrentTime"], "2024-05-01T12:00:00Z");
        let back: GameLog = serde_json::from_value(json).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn test_location_display_matches_wire_name() {
        assert_eq!(Location::Antarctica.to_string(), "antarctica");
        let json = serde_json::to_string(&Location::Antarctica).unwrap();
        assert_eq!(json, "\"antarctica\"");
    }
}
