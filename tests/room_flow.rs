// Integration tests for the room lifecycle: admission, countdown, winner
// decision, abandonment, and the event fabric. Rooms are driven directly
// through their handles; no network I/O involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use bitbattle_backend::db::{Database, Difficulty, GameMode};
use bitbattle_backend::pipeline::SubmissionResult;
use bitbattle_backend::problems::{DifficultyFilter, Problem, ProblemStore, TestCase};
use bitbattle_backend::room::{ClientHandle, JoinReply, Phase, RoomParams, RoomRegistry};

const ROOM: &str = "SWIFT-CODER-1234";

fn test_problem() -> Problem {
    Problem {
        id: "echo-sum".to_string(),
        title: "Echo Sum".to_string(),
        description: "Print the sum of two integers.".to_string(),
        difficulty: Difficulty::Easy,
        examples: vec![],
        hidden_tests: vec![
            TestCase {
                input: "1 2\n".into(),
                expected_output: "3".into(),
                explanation: None,
            },
            TestCase {
                input: "4 5\n".into(),
                expected_output: "9".into(),
                explanation: None,
            },
        ],
        starter_code: HashMap::new(),
        tags: vec![],
        time_limit_minutes: None,
    }
}

async fn setup() -> (Arc<Database>, Arc<RoomRegistry>) {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let problems = Arc::new(ProblemStore::from_problems(vec![test_problem()]));
    let registry = RoomRegistry::new(db.clone(), problems);
    (db, registry)
}

fn passing_result() -> SubmissionResult {
    SubmissionResult {
        passed: true,
        passed_tests: 2,
        total_tests: 2,
        test_results: vec![],
        execution_time_ms: 40,
    }
}

fn failing_result() -> SubmissionResult {
    SubmissionResult {
        passed: false,
        passed_tests: 1,
        total_tests: 2,
        test_results: vec![],
        execution_time_ms: 55,
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
    let raw = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("socket channel closed");
    serde_json::from_str(&raw).unwrap()
}

/// Skip frames until one of the given kind arrives.
async fn next_frame_of(rx: &mut mpsc::Receiver<String>, kind: &str) -> Value {
    loop {
        let frame = next_frame(rx).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Collect every frame already queued (stops after a short quiet period).
async fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(raw)) = timeout(Duration::from_millis(300), rx.recv()).await {
        frames.push(serde_json::from_str(&raw).unwrap());
    }
    frames
}

/// Wait out the 3-second countdown so the room reaches Playing.
async fn wait_for_playing() {
    tokio::time::sleep(Duration::from_millis(3200)).await;
}

#[tokio::test]
async fn test_two_player_casual_flow() {
    let (db, registry) = setup().await;
    db.create_user("a@example.com", "alice", None).await.unwrap();
    db.create_user("b@example.com", "bob", None).await.unwrap();

    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, mut alice_rx) = ClientHandle::new();
    assert!(matches!(
        room.join("alice".into(), alice).await.unwrap(),
        JoinReply::Participant
    ));
    let frame = next_frame(&mut alice_rx).await;
    assert_eq!(frame["type"], "user_joined");
    assert_eq!(frame["data"]["username"], "alice");
    let frame = next_frame(&mut alice_rx).await;
    assert_eq!(frame["type"], "player_count");
    assert_eq!(frame["data"]["current"], 1);
    assert_eq!(frame["data"]["required"], 2);

    let (bob, mut bob_rx) = ClientHandle::new();
    assert!(matches!(
        room.join("bob".into(), bob).await.unwrap(),
        JoinReply::Participant
    ));

    // Both sockets see the same sequence from bob's join onward.
    for rx in [&mut alice_rx, &mut bob_rx] {
        let frame = next_frame_of(rx, "player_count").await;
        assert_eq!(frame["data"]["current"], 2);
        let frame = next_frame(rx).await;
        assert_eq!(frame["type"], "problem_assigned");
        assert_eq!(frame["data"]["problem"]["id"], "echo-sum");
        assert!(frame["data"]["problem"]["hidden_tests"].is_null());
        let frame = next_frame(rx).await;
        assert_eq!(frame["type"], "game_start");
    }

    let snap = room.snapshot().await.unwrap();
    assert_eq!(snap.phase, Phase::Countdown);

    wait_for_playing().await;
    assert_eq!(room.snapshot().await.unwrap().phase, Phase::Playing);

    room.submission_observed("alice".into(), "python".into(), passing_result())
        .await;

    for rx in [&mut alice_rx, &mut bob_rx] {
        let frame = next_frame_of(rx, "submission_result").await;
        assert_eq!(frame["data"]["result"]["passed"], true);
        let frame = next_frame_of(rx, "game_over").await;
        assert_eq!(frame["data"]["winner"], "alice");
        assert_eq!(frame["data"]["game_mode"], "casual");
        assert_eq!(frame["data"]["rating_changes"]["alice"]["change"], 0);
        assert_eq!(frame["data"]["rating_changes"]["bob"]["change"], 0);
        assert!(frame["data"]["solve_time_ms"].as_u64().unwrap() < 60_000);
    }

    // Stats and history were persisted
    let alice_user = db.get_user_by_display_name("alice").await.unwrap().unwrap();
    let stats = db.get_user_stats(alice_user.id).await.unwrap().unwrap();
    assert_eq!(stats.games_won, 1);
    assert_eq!(stats.current_streak, 1);

    let rows = db.game_results_for_room(ROOM).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].placement, 1);
    assert_eq!(rows[0].username, "alice");
}

#[tokio::test]
async fn test_winner_race_exactly_one_game_over() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, mut alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, mut bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();
    wait_for_playing().await;

    // Two passing submissions back to back; the first observed wins.
    room.submission_observed("alice".into(), "python".into(), passing_result())
        .await;
    room.submission_observed("bob".into(), "rust".into(), passing_result())
        .await;

    let alice_frames = drain(&mut alice_rx).await;
    let bob_frames = drain(&mut bob_rx).await;

    for frames in [&alice_frames, &bob_frames] {
        let game_overs: Vec<_> = frames.iter().filter(|f| f["type"] == "game_over").collect();
        assert_eq!(game_overs.len(), 1, "exactly one game_over per socket");
        assert_eq!(game_overs[0]["data"]["winner"], "alice");
    }

    // Bob still got his own (late) passing verdict.
    let bob_results = bob_frames
        .iter()
        .filter(|f| f["type"] == "submission_result")
        .count();
    assert!(bob_results >= 2, "bob sees the winning broadcast and his own result");

    assert_eq!(room.snapshot().await.unwrap().winner.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_failed_submission_goes_to_submitter_only() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, mut alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, mut bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();
    wait_for_playing().await;
    drain(&mut alice_rx).await;
    drain(&mut bob_rx).await;

    room.submission_observed("alice".into(), "python".into(), failing_result())
        .await;

    let alice_frames = drain(&mut alice_rx).await;
    assert!(alice_frames.iter().any(|f| f["type"] == "submission_result"));
    assert!(alice_frames.iter().all(|f| f["type"] != "game_over"));

    let bob_frames = drain(&mut bob_rx).await;
    assert!(bob_frames.is_empty(), "bob must not see alice's failure");

    // Room stays in Playing
    assert_eq!(room.snapshot().await.unwrap().phase, Phase::Playing);
}

#[tokio::test]
async fn test_late_joiner_rejected_then_spectates() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, _alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, _bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();

    // Room is past Waiting: the player path refuses carol.
    let (carol, _carol_rx) = ClientHandle::new();
    assert!(matches!(
        room.join("carol".into(), carol).await.unwrap(),
        JoinReply::Full
    ));

    // Relay one snapshot so the spectator init carries it.
    room.relay_code_change("alice".into(), "print(3)".into(), 1);

    let (spectator, _spec_rx) = ClientHandle::new();
    let init = room.spectate(spectator).await.unwrap();
    assert_eq!(init.room_id, ROOM);
    assert_eq!(init.players, vec!["alice", "bob"]);
    assert!(!init.game_ended);
    assert_eq!(init.player_codes.get("alice").unwrap(), "print(3)");
    assert_eq!(init.spectator_count, 1);
}

#[tokio::test]
async fn test_duplicate_username_becomes_spectator() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (first, _first_rx) = ClientHandle::new();
    room.join("alice".into(), first).await.unwrap();

    let (second, _second_rx) = ClientHandle::new();
    match room.join("alice".into(), second).await.unwrap() {
        JoinReply::Spectator(init) => {
            assert_eq!(init.players, vec!["alice"]);
        }
        other => panic!("duplicate name should spectate, got {other:?}"),
    }

    // The room still waits for a second distinct player
    let snap = room.snapshot().await.unwrap();
    assert_eq!(snap.phase, Phase::Waiting);
    assert_eq!(snap.players.len(), 1);
}

#[tokio::test]
async fn test_code_change_relays_to_everyone_but_sender() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, mut alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, mut bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();
    let (spectator, mut spec_rx) = ClientHandle::new();
    room.spectate(spectator).await.unwrap();

    drain(&mut alice_rx).await;
    drain(&mut bob_rx).await;

    room.relay_code_change("alice".into(), "let x = 1;".into(), 42);

    let bob_frames = drain(&mut bob_rx).await;
    let relayed = bob_frames
        .iter()
        .find(|f| f["type"] == "code_change")
        .expect("bob receives the relay");
    assert_eq!(relayed["data"]["username"], "alice");
    assert_eq!(relayed["data"]["code"], "let x = 1;");
    assert_eq!(relayed["data"]["timestamp"], 42);

    let spec_frames = drain(&mut spec_rx).await;
    assert!(spec_frames.iter().any(|f| f["type"] == "code_change"));

    let alice_frames = drain(&mut alice_rx).await;
    assert!(
        alice_frames.iter().all(|f| f["type"] != "code_change"),
        "sender never receives its own echo"
    );
}

#[tokio::test]
async fn test_last_disconnect_abandons_room() {
    let (db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, _alice_rx) = ClientHandle::new();
    let alice_id = alice.id;
    room.join("alice".into(), alice).await.unwrap();
    let (bob, _bob_rx) = ClientHandle::new();
    let bob_id = bob.id;
    room.join("bob".into(), bob).await.unwrap();

    let (spectator, mut spec_rx) = ClientHandle::new();
    room.spectate(spectator).await.unwrap();

    wait_for_playing().await;

    room.leave(bob_id).await;
    room.leave(alice_id).await;

    let frames = drain(&mut spec_rx).await;
    let game_over = frames
        .iter()
        .find(|f| f["type"] == "game_over")
        .expect("spectator sees the abandonment");
    assert!(game_over["data"]["winner"].is_null());

    // No scoring for abandoned games
    let rows = db.game_results_for_room(ROOM).await.unwrap();
    assert!(rows.is_empty());

    assert_eq!(room.snapshot().await.unwrap().phase, Phase::Ended);
}

#[tokio::test]
async fn test_ranked_game_applies_elo() {
    let (db, registry) = setup().await;
    db.create_user("a@example.com", "alice", None).await.unwrap();
    db.create_user("b@example.com", "bob", None).await.unwrap();

    let room = registry.get_or_create(
        "BRAVE-HACKER-0042",
        RoomParams::new(GameMode::Ranked, DifficultyFilter::Level(Difficulty::Easy), 2),
    );

    let (alice, mut alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, _bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();
    wait_for_playing().await;

    room.submission_observed("alice".into(), "python".into(), passing_result())
        .await;

    let frame = next_frame_of(&mut alice_rx, "game_over").await;
    assert_eq!(frame["data"]["winner"], "alice");
    assert_eq!(frame["data"]["game_mode"], "ranked");
    assert_eq!(frame["data"]["difficulty"], "easy");
    assert_eq!(frame["data"]["rating_changes"]["alice"]["change"], 16);
    assert_eq!(frame["data"]["rating_changes"]["alice"]["new_rating"], 1216);
    assert_eq!(frame["data"]["rating_changes"]["bob"]["change"], -16);
    assert_eq!(frame["data"]["rating_changes"]["bob"]["new_rating"], 1184);

    let alice_user = db.get_user_by_display_name("alice").await.unwrap().unwrap();
    let stats = db.get_user_stats(alice_user.id).await.unwrap().unwrap();
    assert_eq!(stats.easy_rating, 1216);
    assert_eq!(stats.easy_ranked_wins, 1);
}

#[tokio::test]
async fn test_submission_after_end_gets_result_but_no_transition() {
    let (_db, registry) = setup().await;
    let room = registry.get_or_create(
        ROOM,
        RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2),
    );

    let (alice, _alice_rx) = ClientHandle::new();
    room.join("alice".into(), alice).await.unwrap();
    let (bob, mut bob_rx) = ClientHandle::new();
    room.join("bob".into(), bob).await.unwrap();
    wait_for_playing().await;

    room.submission_observed("alice".into(), "python".into(), passing_result())
        .await;
    drain(&mut bob_rx).await;

    // Bob's pipeline finishes after the room ended
    room.submission_observed("bob".into(), "rust".into(), passing_result())
        .await;

    let frames = drain(&mut bob_rx).await;
    assert!(frames.iter().any(|f| f["type"] == "submission_result"));
    assert!(frames.iter().all(|f| f["type"] != "game_over"));
    assert_eq!(room.snapshot().await.unwrap().winner.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_registry_reuses_room_and_tracks_removal() {
    let (_db, registry) = setup().await;
    let params = RoomParams::new(GameMode::Casual, DifficultyFilter::Any, 2);

    let a = registry.get_or_create(ROOM, params);
    let b = registry.get_or_create(ROOM, params);
    assert_eq!(a.code, b.code);
    assert_eq!(registry.len(), 1);

    assert!(registry.get("NOPE-NOPE-0000").is_none());
    registry.remove(ROOM);
    assert!(registry.is_empty());
}
