// Wire protocol for the battle WebSocket.
//
// Every frame is `{"type": <kind>, "data": <payload>}` in both directions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::GameMode;
use crate::pipeline::SubmissionResult;
use crate::problems::ProblemView;

/// Frames sent from the server to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        username: String,
        timestamp: i64,
    },
    UserLeft {
        username: String,
    },
    CodeChange {
        username: String,
        code: String,
        timestamp: i64,
    },
    PlayerCount {
        current: usize,
        required: usize,
    },
    ProblemAssigned {
        problem: ProblemView,
    },
    GameStart {},
    SubmissionResult {
        result: SubmissionResult,
    },
    GameOver(GameOverPayload),
    RoomFull {
        message: String,
    },
    SpectateInit(SpectateInitPayload),
    Error {
        message: String,
        code: String,
    },
}

impl ServerEvent {
    /// Critical frames are never dropped for a slow client; the client is
    /// evicted instead.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerEvent::ProblemAssigned { .. }
                | ServerEvent::GameStart {}
                | ServerEvent::SubmissionResult { .. }
                | ServerEvent::GameOver(_)
                | ServerEvent::SpectateInit(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RatingChangeView {
    pub old_rating: i32,
    pub new_rating: i32,
    pub change: i32,
}

impl From<crate::elo::RatingChange> for RatingChangeView {
    fn from(c: crate::elo::RatingChange) -> Self {
        Self {
            old_rating: c.old_rating,
            new_rating: c.new_rating,
            change: c.change,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GameOverPayload {
    pub winner: Option<String>,
    pub solve_time_ms: Option<u64>,
    pub problem_id: Option<String>,
    pub difficulty: String,
    pub game_mode: GameMode,
    pub players: Vec<String>,
    pub rating_changes: HashMap<String, RatingChangeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpectateInitPayload {
    pub room_id: String,
    pub players: Vec<String>,
    pub game_mode: GameMode,
    pub game_started: bool,
    pub game_ended: bool,
    pub winner: Option<String>,
    pub problem: Option<ProblemView>,
    pub player_codes: HashMap<String, String>,
    pub spectator_count: usize,
}

/// Frames accepted from clients. Anything else is a protocol error answered
/// with an `error` frame; the socket stays open.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    CodeChange {
        code: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_shape() {
        let event = ServerEvent::PlayerCount {
            current: 1,
            required: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "player_count");
        assert_eq!(json["data"]["current"], 1);
        assert_eq!(json["data"]["required"], 2);
    }

    #[test]
    fn test_game_start_has_empty_data() {
        let json = serde_json::to_value(ServerEvent::GameStart {}).unwrap();
        assert_eq!(json["type"], "game_start");
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn test_game_over_payload() {
        let mut rating_changes = HashMap::new();
        rating_changes.insert(
            "alice".to_string(),
            RatingChangeView {
                old_rating: 1200,
                new_rating: 1216,
                change: 16,
            },
        );
        let event = ServerEvent::GameOver(GameOverPayload {
            winner: Some("alice".into()),
            solve_time_ms: Some(4200),
            problem_id: Some("two-sum".into()),
            difficulty: "easy".into(),
            game_mode: GameMode::Ranked,
            players: vec!["alice".into(), "bob".into()],
            rating_changes,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "game_over");
        assert_eq!(json["data"]["winner"], "alice");
        assert_eq!(json["data"]["solve_time_ms"], 4200);
        assert_eq!(json["data"]["rating_changes"]["alice"]["change"], 16);
    }

    #[test]
    fn test_client_event_parse() {
        let frame = r#"{"type":"code_change","data":{"code":"print(1)","timestamp":123}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        let ClientEvent::CodeChange { code, timestamp } = event;
        assert_eq!(code, "print(1)");
        assert_eq!(timestamp, Some(123));
    }

    #[test]
    fn test_client_event_rejects_unknown_kind() {
        let frame = r#"{"type":"hack_the_planet","data":{}}"#;
        assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn test_critical_classification() {
        assert!(ServerEvent::GameStart {}.is_critical());
        assert!(!ServerEvent::UserLeft {
            username: "x".into()
        }
        .is_critical());
        assert!(!ServerEvent::CodeChange {
            username: "x".into(),
            code: String::new(),
            timestamp: 0,
        }
        .is_critical());
    }
}
