// Post-game scoring: Elo deltas, stats upserts, and game-result history.
//
// Invoked by the room once per completed game. Persistence failures are the
// caller's problem only insofar as rating changes degrade to zeros; the room
// never rolls back its in-memory state.

use std::collections::HashMap;

use crate::db::{Database, Difficulty, GameMode, ParticipantOutcome};
use crate::elo::{self, RatingChange, STARTING_RATING};

/// One participant in final placement order. Index 0 is the winner.
#[derive(Debug, Clone)]
pub struct PlacementEntry {
    pub username: String,
    pub solve_time_ms: Option<u64>,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub language: String,
}

/// Persist a completed game and return the per-player rating changes.
///
/// Casual games report each player's current rating with a zero change.
/// Guests (no matching user row) get no stats writes and rate as unranked
/// placeholders.
pub async fn complete_game(
    db: &Database,
    room_id: &str,
    problem_id: &str,
    difficulty: Difficulty,
    mode: GameMode,
    placements: &[PlacementEntry],
) -> Result<HashMap<String, RatingChange>, sqlx::Error> {
    let mut user_ids: Vec<Option<i64>> = Vec::with_capacity(placements.len());
    let mut ratings: Vec<i32> = Vec::with_capacity(placements.len());

    for entry in placements {
        let user = db.get_user_by_display_name(&entry.username).await?;
        match user {
            Some(user) => {
                let rating = db
                    .get_user_stats(user.id)
                    .await?
                    .map(|s| s.rating(difficulty))
                    .unwrap_or(STARTING_RATING);
                user_ids.push(Some(user.id));
                ratings.push(rating);
            }
            None => {
                user_ids.push(None);
                ratings.push(STARTING_RATING);
            }
        }
    }

    let changes: Vec<RatingChange> = match mode {
        GameMode::Ranked => elo::rate_game(&ratings),
        GameMode::Casual => ratings.iter().map(|&r| RatingChange::unchanged(r)).collect(),
    };

    let outcomes: Vec<ParticipantOutcome> = placements
        .iter()
        .enumerate()
        .map(|(i, entry)| ParticipantOutcome {
            user_id: user_ids[i],
            username: entry.username.clone(),
            placement: (i + 1) as i64,
            solve_time_ms: entry.solve_time_ms.map(|ms| ms as i64),
            passed_tests: entry.passed_tests as i64,
            total_tests: entry.total_tests as i64,
            language: entry.language.clone(),
            rating: match mode {
                GameMode::Ranked => Some(changes[i]),
                GameMode::Casual => None,
            },
        })
        .collect();

    db.record_game(room_id, problem_id, mode, difficulty, &outcomes)
        .await?;

    Ok(placements
        .iter()
        .zip(changes)
        .map(|(entry, change)| (entry.username.clone(), change))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn entry(username: &str, won: bool) -> PlacementEntry {
        PlacementEntry {
            username: username.to_string(),
            solve_time_ms: won.then_some(4200),
            passed_tests: if won { 5 } else { 1 },
            total_tests: 5,
            language: "python".to_string(),
        }
    }

    #[tokio::test]
    async fn test_casual_game_zero_changes() {
        let db = test_db().await;
        db.create_user("a@example.com", "alice", None).await.unwrap();
        db.create_user("b@example.com", "bob", None).await.unwrap();

        let changes = complete_game(
            &db,
            "SWIFT-CODER-1234",
            "two-sum",
            Difficulty::Easy,
            GameMode::Casual,
            &[entry("alice", true), entry("bob", false)],
        )
        .await
        .unwrap();

        assert_eq!(changes["alice"].change, 0);
        assert_eq!(changes["alice"].old_rating, STARTING_RATING);
        assert_eq!(changes["bob"].change, 0);

        let alice = db.get_user_by_display_name("alice").await.unwrap().unwrap();
        let stats = db.get_user_stats(alice.id).await.unwrap().unwrap();
        assert_eq!(stats.games_won, 1);
        assert_eq!(stats.easy_rating, STARTING_RATING as i64);
    }

    #[tokio::test]
    async fn test_ranked_game_elo_applied() {
        let db = test_db().await;
        db.create_user("a@example.com", "alice", None).await.unwrap();
        db.create_user("b@example.com", "bob", None).await.unwrap();

        let changes = complete_game(
            &db,
            "SWIFT-CODER-1234",
            "two-sum",
            Difficulty::Easy,
            GameMode::Ranked,
            &[entry("alice", true), entry("bob", false)],
        )
        .await
        .unwrap();

        assert_eq!(changes["alice"].change, 16);
        assert_eq!(changes["alice"].new_rating, 1216);
        assert_eq!(changes["bob"].change, -16);
        assert_eq!(changes["bob"].new_rating, 1184);

        let alice = db.get_user_by_display_name("alice").await.unwrap().unwrap();
        let stats = db.get_user_stats(alice.id).await.unwrap().unwrap();
        assert_eq!(stats.easy_rating, 1216);
        assert_eq!(stats.easy_ranked_wins, 1);
    }

    #[tokio::test]
    async fn test_ranked_zero_sum_across_three() {
        let db = test_db().await;
        for (email, name) in [
            ("a@example.com", "alice"),
            ("b@example.com", "bob"),
            ("c@example.com", "carol"),
        ] {
            db.create_user(email, name, None).await.unwrap();
        }

        let changes = complete_game(
            &db,
            "SWIFT-CODER-1234",
            "two-sum",
            Difficulty::Hard,
            GameMode::Ranked,
            &[entry("alice", true), entry("bob", false), entry("carol", false)],
        )
        .await
        .unwrap();

        let sum: i32 = changes.values().map(|c| c.change).sum();
        assert_eq!(sum, 0);
        assert_eq!(changes["alice"].change, 32);
    }

    #[tokio::test]
    async fn test_guest_participant_skips_stats() {
        let db = test_db().await;
        db.create_user("a@example.com", "alice", None).await.unwrap();

        // bob has no account; the game still records and returns a change map
        let changes = complete_game(
            &db,
            "SWIFT-CODER-1234",
            "two-sum",
            Difficulty::Easy,
            GameMode::Casual,
            &[entry("alice", true), entry("guest-1234", false)],
        )
        .await
        .unwrap();

        assert!(changes.contains_key("guest-1234"));
        let rows = db.game_results_for_room("SWIFT-CODER-1234").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.user_id.is_none()));
    }
}
