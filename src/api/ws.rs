// WebSocket handlers for the player and spectator paths.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use rand::Rng;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth;
use crate::db::GameMode;
use crate::metrics;
use crate::problems::DifficultyFilter;
use crate::rate_limit::RateLimitType;
use crate::room::protocol::{ClientEvent, ServerEvent};
use crate::room::{self, ClientHandle, JoinReply, RoomHandle, RoomParams};

use super::AppState;

const MAX_USERNAME_LEN: usize = 32;

#[derive(Deserialize)]
pub struct PlayParams {
    pub room: String,
    pub difficulty: Option<String>,
    pub players: Option<usize>,
    pub mode: Option<String>,
    pub username: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct SpectateParams {
    pub room: String,
    pub token: Option<String>,
}

/// `GET /ws?room=<code>&difficulty=<d>&players=<n>&mode=<m>` — player socket.
pub async fn ws_play(
    ws: WebSocketUpgrade,
    Query(params): Query<PlayParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_play(socket, params, state))
}

/// `GET /ws/spectate?room=<code>` — spectator socket.
pub async fn ws_spectate(
    ws: WebSocketUpgrade,
    Query(params): Query<SpectateParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_spectate(socket, params, state))
}

async fn handle_play(mut socket: WebSocket, params: PlayParams, state: AppState) {
    metrics::CONNECTED_WEBSOCKETS.inc();

    if !room::is_valid_room_code(&params.room) {
        hold_open_after_error(socket, "invalid room code", "invalid_room_code").await;
        metrics::CONNECTED_WEBSOCKETS.dec();
        return;
    }

    let mode = match params.mode.as_deref() {
        None => GameMode::Casual,
        Some(raw) => match raw.parse() {
            Ok(mode) => mode,
            Err(()) => {
                hold_open_after_error(socket, "invalid mode", "invalid_mode").await;
                metrics::CONNECTED_WEBSOCKETS.dec();
                return;
            }
        },
    };
    let difficulty = match params.difficulty.as_deref() {
        None => DifficultyFilter::Any,
        Some(raw) => match raw.parse() {
            Ok(difficulty) => difficulty,
            Err(()) => {
                hold_open_after_error(socket, "invalid difficulty", "invalid_difficulty").await;
                metrics::CONNECTED_WEBSOCKETS.dec();
                return;
            }
        },
    };
    let required_players = params.players.unwrap_or(2);

    let claims = params
        .token
        .as_deref()
        .and_then(|t| auth::verify_access(t).ok());
    if mode == GameMode::Ranked && claims.is_none() {
        let _ = send_error(
            &mut socket,
            "ranked games require a signed-in account",
            "ranked_requires_auth",
        )
        .await;
        close_normally(&mut socket, "ranked_requires_auth").await;
        metrics::CONNECTED_WEBSOCKETS.dec();
        return;
    }

    let username = resolve_username(claims.map(|c| c.display_name), params.username);

    let room = state.rooms.get_or_create(
        &params.room,
        RoomParams::new(mode, difficulty, required_players),
    );

    let (client, rx) = ClientHandle::new();
    let conn_id = client.id;

    match room.join(username.clone(), client).await {
        Some(JoinReply::Participant) => {
            pump(&mut socket, rx, &room, conn_id, Some(username), &state).await;
            room.leave(conn_id).await;
        }
        Some(JoinReply::Spectator(init)) => {
            // Duplicate username: demoted to spectator per admission policy.
            if send_event(&mut socket, &ServerEvent::SpectateInit(init)).await.is_ok() {
                pump(&mut socket, rx, &room, conn_id, None, &state).await;
            }
            room.leave(conn_id).await;
        }
        Some(JoinReply::Full) => {
            let _ = send_event(
                &mut socket,
                &ServerEvent::RoomFull {
                    message: "room is full or the game already started".to_string(),
                },
            )
            .await;
            close_normally(&mut socket, "room_full").await;
        }
        None => {
            let _ = send_error(&mut socket, "room is shutting down", "room_closed").await;
        }
    }

    state.rate_limiter.forget(&conn_id.to_string());
    metrics::CONNECTED_WEBSOCKETS.dec();
}

async fn handle_spectate(mut socket: WebSocket, params: SpectateParams, state: AppState) {
    metrics::CONNECTED_WEBSOCKETS.inc();

    if !room::is_valid_room_code(&params.room) {
        hold_open_after_error(socket, "invalid room code", "invalid_room_code").await;
        metrics::CONNECTED_WEBSOCKETS.dec();
        return;
    }

    let Some(room) = state.rooms.get(&params.room) else {
        let _ = send_error(&mut socket, "room not found", "room_not_found").await;
        metrics::CONNECTED_WEBSOCKETS.dec();
        return;
    };

    let (client, rx) = ClientHandle::new();
    let conn_id = client.id;

    match room.spectate(client).await {
        Some(init) => {
            if send_event(&mut socket, &ServerEvent::SpectateInit(init)).await.is_ok() {
                pump(&mut socket, rx, &room, conn_id, None, &state).await;
            }
            room.leave(conn_id).await;
        }
        None => {
            let _ = send_error(&mut socket, "room is shutting down", "room_closed").await;
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
}

/// Forward room events to the socket and inbound frames to the room until
/// either side closes. `participant` is None for spectators, whose inbound
/// frames are rejected.
async fn pump(
    socket: &mut WebSocket,
    mut rx: tokio::sync::mpsc::Receiver<String>,
    room: &RoomHandle,
    conn_id: Uuid,
    participant: Option<String>,
    state: &AppState,
) {
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Evicted by the room (or the room is gone)
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(socket, room, conn_id, participant.as_deref(), &text, state)
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // pings are answered by the stack; binary is ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn handle_frame(
    socket: &mut WebSocket,
    room: &RoomHandle,
    conn_id: Uuid,
    participant: Option<&str>,
    text: &str,
    state: &AppState,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            let _ = send_error(socket, "malformed or unknown frame", "bad_frame").await;
            return;
        }
    };

    match event {
        ClientEvent::CodeChange { code, timestamp } => {
            let Some(username) = participant else {
                let _ = send_error(socket, "spectators cannot send code changes", "spectator").await;
                return;
            };
            if state
                .rate_limiter
                .check_limit(&conn_id.to_string(), RateLimitType::CodeChange)
                .is_err()
            {
                tracing::debug!(%conn_id, "code_change rate limit hit, dropping frame");
                return;
            }
            let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            room.relay_code_change(username.to_string(), code, timestamp);
        }
    }
}

fn resolve_username(authenticated: Option<String>, requested: Option<String>) -> String {
    if let Some(name) = authenticated {
        return name;
    }
    if let Some(name) = requested {
        let name = name.trim();
        if !name.is_empty() {
            let mut name = name.to_string();
            name.truncate(MAX_USERNAME_LEN);
            return name;
        }
    }
    format!("guest-{:04}", rand::thread_rng().gen_range(0..10000u16))
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
    socket.send(Message::Text(json.into())).await
}

async fn send_error(socket: &mut WebSocket, message: &str, code: &str) -> Result<(), axum::Error> {
    send_event(
        socket,
        &ServerEvent::Error {
            message: message.to_string(),
            code: code.to_string(),
        },
    )
    .await
}

/// Admission denials close with a normal (1000) close frame after the error
/// or `room_full` frame has been sent.
async fn close_normally(socket: &mut WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Client-input errors leave the socket open: send the error frame, then keep
/// answering inbound frames with it until the client closes.
async fn hold_open_after_error(mut socket: WebSocket, message: &str, code: &str) {
    if send_error(&mut socket, message, code).await.is_err() {
        return;
    }
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(_)) => {
                if send_error(&mut socket, message, code).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_username_prefers_auth() {
        let name = resolve_username(Some("alice".into()), Some("mallory".into()));
        assert_eq!(name, "alice");
    }

    #[test]
    fn test_resolve_username_query_param() {
        let name = resolve_username(None, Some("  bob  ".into()));
        assert_eq!(name, "bob");
    }

    #[test]
    fn test_resolve_username_guest_fallback() {
        let name = resolve_username(None, Some("   ".into()));
        assert!(name.starts_with("guest-"));
        assert_eq!(name.len(), "guest-0000".len());

        let name = resolve_username(None, None);
        assert!(name.starts_with("guest-"));
    }

    #[test]
    fn test_resolve_username_truncates() {
        let long = "x".repeat(100);
        let name = resolve_username(None, Some(long));
        assert_eq!(name.len(), MAX_USERNAME_LEN);
    }
}
