// Per-room actor: owns the state machine and serializes every state change
// and broadcast through one task, so winner decisions and event ordering are
// race-free by construction.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::db::{Difficulty, GameMode};
use crate::metrics;
use crate::pipeline::SubmissionResult;
use crate::problems::{DifficultyFilter, Problem};
use crate::scoring::{self, PlacementEntry};

use super::protocol::{
    GameOverPayload, RatingChangeView, ServerEvent, SpectateInitPayload,
};
use super::{RoomDeps, RoomParams};

/// Bounded per-socket outbound queue.
pub const OUTBOUND_QUEUE: usize = 64;

const COMMAND_QUEUE: usize = 256;
const COUNTDOWN: Duration = Duration::from_secs(3);
const END_GRACE: Duration = Duration::from_secs(30);
const RECENT_PROBLEMS_PER_USER: i64 = 20;

/// Room lifecycle phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Countdown,
    Playing,
    Ended,
}

/// Outbound side of one connected socket. The WS task drains the paired
/// receiver; the actor only ever `try_send`s so a slow client cannot stall
/// the room.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    tx: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

/// Reply to a join attempt on the player path.
#[derive(Debug)]
pub enum JoinReply {
    /// Admitted as a participant.
    Participant,
    /// Username already taken in this room; admitted as a spectator instead.
    Spectator(SpectateInitPayload),
    /// Room already started or at capacity.
    Full,
}

/// Point-in-time view of a room, for `/submit` phase checks and the live
/// room listing.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub code: String,
    pub mode: GameMode,
    pub difficulty: DifficultyFilter,
    pub phase: Phase,
    pub players: Vec<String>,
    pub required_players: usize,
    pub spectator_count: usize,
    pub problem_id: Option<String>,
    pub problem_title: Option<String>,
    pub problem_difficulty: Option<Difficulty>,
    pub winner: Option<String>,
    pub elapsed_seconds: u64,
}

pub enum RoomCommand {
    Join {
        username: String,
        client: ClientHandle,
        resp: oneshot::Sender<JoinReply>,
    },
    Spectate {
        client: ClientHandle,
        resp: oneshot::Sender<SpectateInitPayload>,
    },
    CodeChange {
        username: String,
        code: String,
        timestamp: i64,
    },
    Leave {
        conn_id: Uuid,
    },
    SubmissionObserved {
        username: String,
        language: String,
        result: SubmissionResult,
    },
    CountdownElapsed,
    GraceElapsed,
    Snapshot {
        resp: oneshot::Sender<RoomSnapshot>,
    },
}

/// Cloneable address of a room's actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub code: String,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub async fn join(&self, username: String, client: ClientHandle) -> Option<JoinReply> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Join {
                username,
                client,
                resp,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn spectate(&self, client: ClientHandle) -> Option<SpectateInitPayload> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Spectate { client, resp })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Relay an editor snapshot. Load-shedding: if the room's command queue
    /// is full the snapshot is dropped, the next one supersedes it anyway.
    pub fn relay_code_change(&self, username: String, code: String, timestamp: i64) {
        let _ = self.tx.try_send(RoomCommand::CodeChange {
            username,
            code,
            timestamp,
        });
    }

    pub async fn leave(&self, conn_id: Uuid) {
        let _ = self.tx.send(RoomCommand::Leave { conn_id }).await;
    }

    pub async fn submission_observed(
        &self,
        username: String,
        language: String,
        result: SubmissionResult,
    ) {
        let _ = self
            .tx
            .send(RoomCommand::SubmissionObserved {
                username,
                language,
                result,
            })
            .await;
    }

    pub async fn snapshot(&self) -> Option<RoomSnapshot> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(RoomCommand::Snapshot { resp }).await.ok()?;
        rx.await.ok()
    }
}

struct Participant {
    username: String,
    client: ClientHandle,
}

struct RoomActor {
    code: String,
    mode: GameMode,
    difficulty: DifficultyFilter,
    required_players: usize,
    phase: Phase,
    participants: Vec<Participant>,
    spectators: Vec<ClientHandle>,
    /// Usernames that left mid-game, in leave order.
    departed: Vec<String>,
    problem: Option<Problem>,
    started_at: Option<Instant>,
    winner: Option<String>,
    player_codes: HashMap<String, String>,
    /// Latest judged counts per username: (passed, total, language).
    last_submissions: HashMap<String, (usize, usize, String)>,
    deps: RoomDeps,
    self_tx: mpsc::Sender<RoomCommand>,
    rx: mpsc::Receiver<RoomCommand>,
}

pub(super) fn spawn_room(code: String, params: RoomParams, deps: RoomDeps) -> RoomHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let actor = RoomActor {
        code: code.clone(),
        mode: params.mode,
        difficulty: params.difficulty,
        required_players: params.required_players,
        phase: Phase::Waiting,
        participants: Vec::new(),
        spectators: Vec::new(),
        departed: Vec::new(),
        problem: None,
        started_at: None,
        winner: None,
        player_codes: HashMap::new(),
        last_submissions: HashMap::new(),
        deps,
        self_tx: tx.clone(),
        rx,
    };
    tokio::spawn(actor.run());
    RoomHandle { code, tx }
}

impl RoomActor {
    async fn run(mut self) {
        metrics::ACTIVE_ROOMS.inc();
        tracing::info!(room = %self.code, mode = %self.mode, "room created");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                RoomCommand::Join {
                    username,
                    client,
                    resp,
                } => self.handle_join(username, client, resp).await,
                RoomCommand::Spectate { client, resp } => {
                    let init = self.admit_spectator(client);
                    let _ = resp.send(init);
                }
                RoomCommand::CodeChange {
                    username,
                    code,
                    timestamp,
                } => self.handle_code_change(username, code, timestamp),
                RoomCommand::Leave { conn_id } => self.handle_leave(conn_id),
                RoomCommand::SubmissionObserved {
                    username,
                    language,
                    result,
                } => self.handle_submission(username, language, result).await,
                RoomCommand::CountdownElapsed => {
                    if self.phase == Phase::Countdown {
                        self.phase = Phase::Playing;
                        self.started_at = Some(Instant::now());
                        tracing::info!(room = %self.code, "game is live");
                    }
                }
                RoomCommand::GraceElapsed => break,
                RoomCommand::Snapshot { resp } => {
                    let _ = resp.send(self.snapshot());
                }
            }
        }

        if let Some(registry) = self.deps.registry.upgrade() {
            registry.remove(&self.code);
        }
        metrics::ACTIVE_ROOMS.dec();
        tracing::info!(room = %self.code, "room released");
    }

    // ── Admission ─────────────────────────────────────────────────────

    async fn handle_join(
        &mut self,
        username: String,
        client: ClientHandle,
        resp: oneshot::Sender<JoinReply>,
    ) {
        if self.phase != Phase::Waiting || self.participants.len() >= self.required_players {
            let _ = resp.send(JoinReply::Full);
            return;
        }
        if self.participants.iter().any(|p| p.username == username) {
            let init = self.admit_spectator(client);
            let _ = resp.send(JoinReply::Spectator(init));
            return;
        }

        tracing::info!(room = %self.code, username = %username, "participant joined");
        self.participants.push(Participant {
            username: username.clone(),
            client,
        });
        let _ = resp.send(JoinReply::Participant);

        self.broadcast(&ServerEvent::UserJoined {
            username,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        self.broadcast(&ServerEvent::PlayerCount {
            current: self.participants.len(),
            required: self.required_players,
        });

        if self.participants.len() == self.required_players {
            self.begin_countdown().await;
        }
    }

    fn admit_spectator(&mut self, client: ClientHandle) -> SpectateInitPayload {
        self.spectators.push(client);
        SpectateInitPayload {
            room_id: self.code.clone(),
            players: self.participants.iter().map(|p| p.username.clone()).collect(),
            game_mode: self.mode,
            game_started: self.phase >= Phase::Playing,
            game_ended: self.phase == Phase::Ended,
            winner: self.winner.clone(),
            problem: self.problem.as_ref().map(|p| p.view()),
            player_codes: self.player_codes.clone(),
            spectator_count: self.spectators.len(),
        }
    }

    // ── Game start ────────────────────────────────────────────────────

    async fn begin_countdown(&mut self) {
        self.phase = Phase::Countdown;

        let mut user_ids = Vec::new();
        for p in &self.participants {
            match self.deps.db.get_user_by_display_name(&p.username).await {
                Ok(Some(user)) => user_ids.push(user.id),
                Ok(None) => {}
                Err(e) => tracing::warn!(room = %self.code, "history lookup failed: {e}"),
            }
        }
        let excluding: HashSet<String> = self
            .deps
            .db
            .recent_problem_ids(&user_ids, RECENT_PROBLEMS_PER_USER)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let Some(problem) = self.deps.problems.choose(self.difficulty, &excluding).cloned()
        else {
            self.fail_room("no problem available for this difficulty");
            return;
        };

        tracing::info!(room = %self.code, problem = %problem.id, "game starting");
        self.broadcast(&ServerEvent::ProblemAssigned {
            problem: problem.view(),
        });
        self.broadcast(&ServerEvent::GameStart {});
        self.problem = Some(problem);

        metrics::GAMES_STARTED_TOTAL
            .with_label_values(&[self.mode.as_str()])
            .inc();

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COUNTDOWN).await;
            let _ = tx.send(RoomCommand::CountdownElapsed).await;
        });
    }

    // ── Relayed edits ─────────────────────────────────────────────────

    fn handle_code_change(&mut self, username: String, code: String, timestamp: i64) {
        if self.phase == Phase::Ended {
            return;
        }
        let Some(sender) = self
            .participants
            .iter()
            .find(|p| p.username == username)
            .map(|p| p.client.id)
        else {
            return;
        };

        self.player_codes.insert(username.clone(), code.clone());
        self.fan_out(
            &ServerEvent::CodeChange {
                username,
                code,
                timestamp,
            },
            Some(sender),
        );
    }

    // ── Submissions and winner decision ──────────────────────────────

    async fn handle_submission(
        &mut self,
        username: String,
        language: String,
        result: SubmissionResult,
    ) {
        self.last_submissions.insert(
            username.clone(),
            (result.passed_tests, result.total_tests, language),
        );

        let wins = self.phase == Phase::Playing && result.passed && self.winner.is_none();
        if !wins {
            // Failed attempts and post-game passes go to the submitter only.
            self.send_to_participant(&username, &ServerEvent::SubmissionResult { result });
            return;
        }

        let solve_time_ms = self
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        tracing::info!(
            room = %self.code,
            username = %username,
            solve_time_ms,
            "winning submission observed"
        );

        self.winner = Some(username.clone());
        self.phase = Phase::Ended;
        self.broadcast(&ServerEvent::SubmissionResult { result });

        let placements = self.placement_order(&username, solve_time_ms);
        let problem_id = self.problem.as_ref().map(|p| p.id.clone());
        let problem_difficulty = self
            .problem
            .as_ref()
            .map(|p| p.difficulty)
            .or(self.difficulty.level())
            .unwrap_or(Difficulty::Medium);

        // Persistence failure degrades rating changes to zeros; the room
        // state is already final.
        let rating_changes: HashMap<String, RatingChangeView> = match scoring::complete_game(
            &self.deps.db,
            &self.code,
            problem_id.as_deref().unwrap_or(""),
            problem_difficulty,
            self.mode,
            &placements,
        )
        .await
        {
            Ok(changes) => changes.into_iter().map(|(k, v)| (k, v.into())).collect(),
            Err(e) => {
                tracing::error!(room = %self.code, "failed to persist game result: {e}");
                placements
                    .iter()
                    .map(|p| {
                        (
                            p.username.clone(),
                            RatingChangeView {
                                old_rating: 0,
                                new_rating: 0,
                                change: 0,
                            },
                        )
                    })
                    .collect()
            }
        };

        metrics::GAMES_COMPLETED_TOTAL
            .with_label_values(&[self.mode.as_str()])
            .inc();
        metrics::SOLVE_TIME_SECONDS
            .with_label_values(&[self.mode.as_str()])
            .observe(solve_time_ms as f64 / 1000.0);

        self.broadcast(&ServerEvent::GameOver(GameOverPayload {
            winner: Some(username),
            solve_time_ms: Some(solve_time_ms),
            problem_id,
            difficulty: problem_difficulty.to_string(),
            game_mode: self.mode,
            players: placements.iter().map(|p| p.username.clone()).collect(),
            rating_changes,
        }));

        self.schedule_grace();
    }

    /// Final placement: winner, then connected players in join order, then
    /// mid-game leavers with later departures placing higher.
    fn placement_order(&self, winner: &str, solve_time_ms: u64) -> Vec<PlacementEntry> {
        let mut order = vec![self.placement_entry(winner, Some(solve_time_ms))];
        for p in &self.participants {
            if p.username != winner {
                order.push(self.placement_entry(&p.username, None));
            }
        }
        for username in self.departed.iter().rev() {
            order.push(self.placement_entry(username, None));
        }
        order
    }

    fn placement_entry(&self, username: &str, solve_time_ms: Option<u64>) -> PlacementEntry {
        let (passed, total, language) = self
            .last_submissions
            .get(username)
            .cloned()
            .unwrap_or((0, self.problem.as_ref().map(|p| p.hidden_tests.len()).unwrap_or(0), String::new()));
        PlacementEntry {
            username: username.to_string(),
            solve_time_ms,
            passed_tests: passed,
            total_tests: total,
            language,
        }
    }

    // ── Departures ────────────────────────────────────────────────────

    fn handle_leave(&mut self, conn_id: Uuid) {
        if let Some(idx) = self.participants.iter().position(|p| p.client.id == conn_id) {
            let participant = self.participants.remove(idx);
            tracing::info!(room = %self.code, username = %participant.username, "participant left");
            self.broadcast(&ServerEvent::UserLeft {
                username: participant.username.clone(),
            });
            if self.phase == Phase::Waiting {
                self.broadcast(&ServerEvent::PlayerCount {
                    current: self.participants.len(),
                    required: self.required_players,
                });
            } else if self.phase != Phase::Ended {
                self.departed.push(participant.username);
            }
            if self.participants.is_empty() && self.phase != Phase::Ended {
                self.abandon();
            }
        } else {
            self.spectators.retain(|s| s.id != conn_id);
        }
    }

    /// Last participant gone before the game finished: no winner, no scoring.
    fn abandon(&mut self) {
        tracing::info!(room = %self.code, "room abandoned");
        self.phase = Phase::Ended;
        metrics::GAMES_ABANDONED_TOTAL.inc();

        self.broadcast(&ServerEvent::GameOver(GameOverPayload {
            winner: None,
            solve_time_ms: None,
            problem_id: self.problem.as_ref().map(|p| p.id.clone()),
            difficulty: self
                .problem
                .as_ref()
                .map(|p| p.difficulty.to_string())
                .unwrap_or_else(|| self.difficulty.to_string()),
            game_mode: self.mode,
            players: self.departed.clone(),
            rating_changes: HashMap::new(),
        }));
        self.schedule_grace();
    }

    /// Invariant violation or unrecoverable setup error: close the room so
    /// clients exit deterministically.
    fn fail_room(&mut self, message: &str) {
        tracing::error!(room = %self.code, "room failed: {message}");
        self.broadcast(&ServerEvent::Error {
            message: message.to_string(),
            code: "internal".to_string(),
        });
        self.phase = Phase::Ended;
        self.broadcast(&ServerEvent::GameOver(GameOverPayload {
            winner: None,
            solve_time_ms: None,
            problem_id: None,
            difficulty: self.difficulty.to_string(),
            game_mode: self.mode,
            players: self.participants.iter().map(|p| p.username.clone()).collect(),
            rating_changes: HashMap::new(),
        }));
        self.schedule_grace();
    }

    fn schedule_grace(&self) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(END_GRACE).await;
            let _ = tx.send(RoomCommand::GraceElapsed).await;
        });
    }

    // ── Fan-out ───────────────────────────────────────────────────────

    fn broadcast(&mut self, event: &ServerEvent) {
        self.fan_out(event, None);
    }

    /// Serialize once and push to every connected socket, optionally skipping
    /// the originator. Slow sockets drop non-critical frames; a critical
    /// frame that cannot be queued evicts the socket.
    fn fan_out(&mut self, event: &ServerEvent, skip: Option<Uuid>) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(room = %self.code, "failed to serialize event: {e}");
                return;
            }
        };
        let critical = event.is_critical();

        let mut evicted = Vec::new();
        let targets = self
            .participants
            .iter()
            .map(|p| &p.client)
            .chain(self.spectators.iter());
        for client in targets {
            if skip == Some(client.id) {
                continue;
            }
            match client.tx.try_send(json.clone()) {
                Ok(()) => metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc(),
                Err(mpsc::error::TrySendError::Full(_)) if !critical => {
                    metrics::WEBSOCKET_MESSAGES_DROPPED_TOTAL.inc();
                }
                Err(_) => evicted.push(client.id),
            }
        }

        for conn_id in evicted {
            tracing::warn!(room = %self.code, %conn_id, "evicting slow or dead socket");
            self.handle_leave(conn_id);
        }
    }

    fn send_to_participant(&mut self, username: &str, event: &ServerEvent) {
        let Some(client) = self
            .participants
            .iter()
            .find(|p| p.username == username)
            .map(|p| p.client.clone())
        else {
            return;
        };
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(room = %self.code, "failed to serialize event: {e}");
                return;
            }
        };
        match client.tx.try_send(json) {
            Ok(()) => metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc(),
            Err(_) => {
                tracing::warn!(room = %self.code, username, "evicting slow or dead socket");
                self.handle_leave(client.id);
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            code: self.code.clone(),
            mode: self.mode,
            difficulty: self.difficulty,
            phase: self.phase,
            players: self.participants.iter().map(|p| p.username.clone()).collect(),
            required_players: self.required_players,
            spectator_count: self.spectators.len(),
            problem_id: self.problem.as_ref().map(|p| p.id.clone()),
            problem_title: self.problem.as_ref().map(|p| p.title.clone()),
            problem_difficulty: self.problem.as_ref().map(|p| p.difficulty),
            winner: self.winner.clone(),
            elapsed_seconds: self
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}
