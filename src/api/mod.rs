// HTTP API routes (submissions, matchmaking, live rooms, problems).

pub mod ws;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::{AuthUser, OptionalAuthUser};
use crate::db::{Database, Difficulty};
use crate::matchmaker::Matchmaker;
use crate::pipeline::SubmissionPipeline;
use crate::problems::{DifficultyFilter, ProblemStore};
use crate::rate_limit::{RateLimitType, RateLimiter};
use crate::room::{self, Phase, RoomRegistry};
use crate::sandbox::Language;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub username: String,
    pub problem_id: String,
    pub code: String,
    pub language: String,
    pub room_id: String,
}

#[derive(Deserialize)]
pub struct MatchmakingJoinRequest {
    pub username: String,
    pub difficulty: Option<String>,
    pub mode: Option<String>,
    pub connection_id: Option<String>,
}

#[derive(Deserialize)]
pub struct MatchmakingLeaveRequest {
    pub connection_id: String,
}

#[derive(Deserialize)]
pub struct MatchmakingStatusParams {
    pub connection_id: String,
}

#[derive(Deserialize)]
pub struct LeaderboardParams {
    pub difficulty: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: String,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub problems: Arc<ProblemStore>,
    pub rooms: Arc<RoomRegistry>,
    pub matchmaker: Matchmaker,
    pub pipeline: Arc<SubmissionPipeline>,
    pub rate_limiter: RateLimiter,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: sqlx::Error) -> impl IntoResponse {
    tracing::error!("Database error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        // Battle
        .route("/submit", post(submit))
        .route("/rooms/live", get(live_rooms))
        // Matchmaking
        .route("/matchmaking/join", post(matchmaking_join))
        .route("/matchmaking/leave", post(matchmaking_leave))
        .route("/matchmaking/status", get(matchmaking_status))
        // Problems
        .route("/problems", get(list_problems))
        .route("/problems/{id}", get(get_problem))
        // Players
        .route("/leaderboard", get(leaderboard))
        .route("/users/me", get(me).put(update_profile))
        // WebSocket
        .route("/ws", get(ws::ws_play))
        .route("/ws/spectate", get(ws::ws_spectate))
        .with_state(state)
}

// ── Submission handler ────────────────────────────────────────────────

async fn submit(
    State(state): State<AppState>,
    OptionalAuthUser(claims): OptionalAuthUser,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    let username = claims
        .map(|c| c.display_name)
        .unwrap_or_else(|| req.username.clone());
    if username.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "username is required").into_response();
    }
    if req.code.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "code is required").into_response();
    }
    let Ok(language) = req.language.parse::<Language>() else {
        return json_error(StatusCode::BAD_REQUEST, "unsupported language").into_response();
    };
    if !room::is_valid_room_code(&req.room_id) {
        return json_error(StatusCode::BAD_REQUEST, "invalid room code").into_response();
    }

    let Some(problem) = state.problems.get(&req.problem_id) else {
        return json_error(StatusCode::NOT_FOUND, "Problem not found").into_response();
    };

    let Some(room) = state.rooms.get(&req.room_id) else {
        return json_error(StatusCode::NOT_FOUND, "Room not found").into_response();
    };
    let Some(snapshot) = room.snapshot().await else {
        return json_error(StatusCode::NOT_FOUND, "Room not found").into_response();
    };
    if snapshot.phase != Phase::Playing {
        return json_error(StatusCode::CONFLICT, "Room is not currently playing").into_response();
    }
    if snapshot.problem_id.as_deref() != Some(req.problem_id.as_str()) {
        return json_error(StatusCode::CONFLICT, "Room is playing a different problem")
            .into_response();
    }

    if let Err(e) = state.rate_limiter.check_limit(&username, RateLimitType::Submit) {
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string()).into_response();
    }

    tracing::info!(room = %req.room_id, %username, %language, "judging submission");
    let result = state
        .pipeline
        .submit(&username, &req.room_id, problem, language, &req.code)
        .await;

    // The room makes the winner decision; the HTTP response carries the
    // verdict regardless of whether the submitter is still connected.
    room.submission_observed(username, language.as_str().to_string(), result.clone())
        .await;

    (StatusCode::OK, Json(json!(result))).into_response()
}

// ── Live rooms ────────────────────────────────────────────────────────

async fn live_rooms(State(state): State<AppState>) -> impl IntoResponse {
    let mut live_games = Vec::new();
    for handle in state.rooms.handles() {
        let Some(snap) = handle.snapshot().await else {
            continue;
        };
        if snap.phase < Phase::Playing {
            continue;
        }
        live_games.push(json!({
            "room_id": snap.code,
            "players": snap.players,
            "player_count": snap.players.len(),
            "spectator_count": snap.spectator_count,
            "game_mode": snap.mode,
            "problem": snap.problem_title.map(|title| json!({
                "title": title,
                "difficulty": snap.problem_difficulty,
            })),
            "game_ended": snap.phase == Phase::Ended,
            "elapsed_seconds": snap.elapsed_seconds,
        }));
    }
    let total = live_games.len();
    (StatusCode::OK, Json(json!({ "live_games": live_games, "total": total })))
}

// ── Matchmaking handlers ──────────────────────────────────────────────

async fn matchmaking_join(
    State(state): State<AppState>,
    Json(req): Json<MatchmakingJoinRequest>,
) -> impl IntoResponse {
    if req.username.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "username is required").into_response();
    }
    let difficulty = match req.difficulty.as_deref() {
        None => DifficultyFilter::Any,
        Some(raw) => match raw.parse() {
            Ok(d) => d,
            Err(()) => {
                return json_error(StatusCode::BAD_REQUEST, "invalid difficulty").into_response()
            }
        },
    };
    let mode = match req.mode.as_deref() {
        None => crate::db::GameMode::Casual,
        Some(raw) => match raw.parse() {
            Ok(m) => m,
            Err(()) => return json_error(StatusCode::BAD_REQUEST, "invalid mode").into_response(),
        },
    };

    let connection_id = req
        .connection_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let queue_size = state
        .matchmaker
        .join(&connection_id, &req.username, difficulty, mode);

    (
        StatusCode::OK,
        Json(json!({
            "connection_id": connection_id,
            "queue_size": queue_size,
        })),
    )
        .into_response()
}

async fn matchmaking_leave(
    State(state): State<AppState>,
    Json(req): Json<MatchmakingLeaveRequest>,
) -> impl IntoResponse {
    let left = state.matchmaker.leave(&req.connection_id);
    (StatusCode::OK, Json(json!({ "left": left })))
}

async fn matchmaking_status(
    State(state): State<AppState>,
    Query(params): Query<MatchmakingStatusParams>,
) -> impl IntoResponse {
    let status = state.matchmaker.status(&params.connection_id);
    (StatusCode::OK, Json(json!(status)))
}

// ── Problem handlers ──────────────────────────────────────────────────

async fn list_problems(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<_> = state.problems.all().iter().map(|p| p.view()).collect();
    (StatusCode::OK, Json(json!(views)))
}

async fn get_problem(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.problems.get(&id) {
        Some(problem) => (StatusCode::OK, Json(json!(problem.view()))).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Problem not found").into_response(),
    }
}

// ── Player handlers ───────────────────────────────────────────────────

async fn leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardParams>,
) -> impl IntoResponse {
    let difficulty = match params.difficulty.as_deref() {
        None => Difficulty::Medium,
        Some(raw) => match raw.parse() {
            Ok(d) => d,
            Err(()) => {
                return json_error(StatusCode::BAD_REQUEST, "invalid difficulty").into_response()
            }
        },
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    match state.db.leaderboard(difficulty, limit).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({ "difficulty": difficulty, "entries": entries })),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn me(State(state): State<AppState>, AuthUser(claims): AuthUser) -> impl IntoResponse {
    let user = match state.db.get_user(claims.sub).await {
        Ok(Some(user)) => user,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "User not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };
    let stats = match state.db.get_user_stats(claims.sub).await {
        Ok(stats) => stats,
        Err(e) => return internal_error(e).into_response(),
    };
    (StatusCode::OK, Json(json!({ "user": user, "stats": stats }))).into_response()
}

async fn update_profile(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> impl IntoResponse {
    if req.display_name.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "display_name is required").into_response();
    }
    match state
        .db
        .update_display_name(claims.sub, req.display_name.trim())
        .await
    {
        Ok(Some(user)) => (StatusCode::OK, Json(json!(user))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "User not found").into_response(),
        Err(e) => {
            if e.to_string().contains("UNIQUE") {
                json_error(StatusCode::CONFLICT, "Display name already taken").into_response()
            } else {
                internal_error(e).into_response()
            }
        }
    }
}
