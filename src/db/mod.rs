// Database access layer (SQLite via sqlx).

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::elo::{RatingChange, STARTING_RATING};

// ── Shared domain enums ───────────────────────────────────────────────

/// Problem / rating difficulty bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a game affects ratings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Casual,
    Ranked,
}

impl GameMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Casual => "casual",
            GameMode::Ranked => "ranked",
        }
    }
}

impl std::str::FromStr for GameMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "casual" => Ok(GameMode::Casual),
            "ranked" => Ok(GameMode::Ranked),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Row models ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub created_at: String,
}

/// Per-user aggregate stats plus one rating bucket per difficulty.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserStats {
    pub user_id: i64,
    pub games_played: i64,
    pub games_won: i64,
    pub games_lost: i64,
    pub problems_solved: i64,
    pub fastest_solve_ms: Option<i64>,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_played_at: Option<String>,
    pub easy_rating: i64,
    pub easy_peak_rating: i64,
    pub easy_ranked_games: i64,
    pub easy_ranked_wins: i64,
    pub medium_rating: i64,
    pub medium_peak_rating: i64,
    pub medium_ranked_games: i64,
    pub medium_ranked_wins: i64,
    pub hard_rating: i64,
    pub hard_peak_rating: i64,
    pub hard_ranked_games: i64,
    pub hard_ranked_wins: i64,
}

impl UserStats {
    pub fn rating(&self, difficulty: Difficulty) -> i32 {
        match difficulty {
            Difficulty::Easy => self.easy_rating as i32,
            Difficulty::Medium => self.medium_rating as i32,
            Difficulty::Hard => self.hard_rating as i32,
        }
    }

    pub fn peak_rating(&self, difficulty: Difficulty) -> i32 {
        match difficulty {
            Difficulty::Easy => self.easy_peak_rating as i32,
            Difficulty::Medium => self.medium_peak_rating as i32,
            Difficulty::Hard => self.hard_peak_rating as i32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameResultRow {
    pub id: i64,
    pub room_id: String,
    pub problem_id: String,
    pub user_id: Option<i64>,
    pub username: String,
    pub placement: i64,
    pub total_players: i64,
    pub solve_time_ms: Option<i64>,
    pub passed_tests: i64,
    pub total_tests: i64,
    pub language: String,
    pub game_mode: String,
    pub difficulty: String,
    pub rating_change: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRow {
    pub token_hash: String,
    pub user_id: i64,
    pub expires_at: String,
    pub revoked_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub display_name: String,
    pub rating: i64,
    pub peak_rating: i64,
    pub ranked_games: i64,
    pub ranked_wins: i64,
}

/// One participant's share of a finished game, as handed to [`Database::record_game`].
#[derive(Debug, Clone)]
pub struct ParticipantOutcome {
    pub user_id: Option<i64>,
    pub username: String,
    pub placement: i64,
    pub solve_time_ms: Option<i64>,
    pub passed_tests: i64,
    pub total_tests: i64,
    pub language: String,
    pub rating: Option<RatingChange>,
}

// ── Database ──────────────────────────────────────────────────────────

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL UNIQUE,
                avatar TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS user_stats (
                user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                games_played INTEGER NOT NULL DEFAULT 0,
                games_won INTEGER NOT NULL DEFAULT 0,
                games_lost INTEGER NOT NULL DEFAULT 0,
                problems_solved INTEGER NOT NULL DEFAULT 0,
                fastest_solve_ms INTEGER,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                last_played_at TEXT,
                easy_rating INTEGER NOT NULL DEFAULT {r},
                easy_peak_rating INTEGER NOT NULL DEFAULT {r},
                easy_ranked_games INTEGER NOT NULL DEFAULT 0,
                easy_ranked_wins INTEGER NOT NULL DEFAULT 0,
                medium_rating INTEGER NOT NULL DEFAULT {r},
                medium_peak_rating INTEGER NOT NULL DEFAULT {r},
                medium_ranked_games INTEGER NOT NULL DEFAULT 0,
                medium_ranked_wins INTEGER NOT NULL DEFAULT 0,
                hard_rating INTEGER NOT NULL DEFAULT {r},
                hard_peak_rating INTEGER NOT NULL DEFAULT {r},
                hard_ranked_games INTEGER NOT NULL DEFAULT 0,
                hard_ranked_wins INTEGER NOT NULL DEFAULT 0
            )
        "#,
            r = STARTING_RATING
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS game_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                problem_id TEXT NOT NULL,
                user_id INTEGER REFERENCES users(id),
                username TEXT NOT NULL,
                placement INTEGER NOT NULL,
                total_players INTEGER NOT NULL,
                solve_time_ms INTEGER,
                passed_tests INTEGER NOT NULL DEFAULT 0,
                total_tests INTEGER NOT NULL DEFAULT 0,
                language TEXT NOT NULL DEFAULT '',
                game_mode TEXT NOT NULL,
                difficulty TEXT NOT NULL,
                rating_change INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                token_hash TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at TEXT NOT NULL,
                revoked_at TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        avatar: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, display_name, avatar) VALUES (?, ?, ?) RETURNING id, email, display_name, avatar, created_at",
        )
        .bind(email)
        .bind(display_name)
        .bind(avatar)
        .fetch_one(&self.pool)
        .await?;

        // Every user starts with a stats row so rating lookups never miss.
        sqlx::query("INSERT INTO user_stats (user_id) VALUES (?)")
            .bind(user.id)
            .execute(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, avatar, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, avatar, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_user_by_display_name(
        &self,
        display_name: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, avatar, created_at FROM users WHERE display_name = ?",
        )
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn update_display_name(
        &self,
        id: i64,
        display_name: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET display_name = ? WHERE id = ?")
            .bind(display_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_user(id).await
    }

    // ── Stats ─────────────────────────────────────────────────────────

    pub async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, sqlx::Error> {
        sqlx::query_as::<_, UserStats>("SELECT * FROM user_stats WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn leaderboard(
        &self,
        difficulty: Difficulty,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
        let d = difficulty.as_str();
        let sql = format!(
            "SELECT s.user_id, u.display_name, s.{d}_rating AS rating, s.{d}_peak_rating AS peak_rating, \
             s.{d}_ranked_games AS ranked_games, s.{d}_ranked_wins AS ranked_wins \
             FROM user_stats s JOIN users u ON u.id = s.user_id \
             WHERE s.{d}_ranked_games > 0 \
             ORDER BY rating DESC, ranked_wins DESC LIMIT ?"
        );
        sqlx::query_as::<_, LeaderboardEntry>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    /// Problem ids a set of users has seen recently, for room exclusion.
    pub async fn recent_problem_ids(
        &self,
        user_ids: &[i64],
        per_user_limit: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let mut seen = Vec::new();
        for &uid in user_ids {
            let ids: Vec<String> = sqlx::query_scalar(
                "SELECT problem_id FROM game_results WHERE user_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(uid)
            .bind(per_user_limit)
            .fetch_all(&self.pool)
            .await?;
            seen.extend(ids);
        }
        seen.sort();
        seen.dedup();
        Ok(seen)
    }

    // ── Game results ──────────────────────────────────────────────────

    /// Persist one finished game: a `game_results` row per participant plus
    /// all stats and rating updates, atomically.
    pub async fn record_game(
        &self,
        room_id: &str,
        problem_id: &str,
        mode: GameMode,
        difficulty: Difficulty,
        outcomes: &[ParticipantOutcome],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for o in outcomes {
            sqlx::query(
                "INSERT INTO game_results \
                 (room_id, problem_id, user_id, username, placement, total_players, solve_time_ms, \
                  passed_tests, total_tests, language, game_mode, difficulty, rating_change) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(room_id)
            .bind(problem_id)
            .bind(o.user_id)
            .bind(&o.username)
            .bind(o.placement)
            .bind(outcomes.len() as i64)
            .bind(o.solve_time_ms)
            .bind(o.passed_tests)
            .bind(o.total_tests)
            .bind(&o.language)
            .bind(mode.as_str())
            .bind(difficulty.as_str())
            .bind(o.rating.map(|r| r.change as i64).unwrap_or(0))
            .execute(&mut *tx)
            .await?;

            let Some(uid) = o.user_id else { continue };
            let won = o.placement == 1;

            if won {
                sqlx::query(
                    "UPDATE user_stats SET \
                     games_played = games_played + 1, \
                     games_won = games_won + 1, \
                     problems_solved = problems_solved + 1, \
                     current_streak = current_streak + 1, \
                     longest_streak = MAX(longest_streak, current_streak + 1), \
                     fastest_solve_ms = MIN(COALESCE(fastest_solve_ms, ?1), ?1), \
                     last_played_at = datetime('now') \
                     WHERE user_id = ?2",
                )
                .bind(o.solve_time_ms)
                .bind(uid)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE user_stats SET \
                     games_played = games_played + 1, \
                     games_lost = games_lost + 1, \
                     current_streak = 0, \
                     last_played_at = datetime('now') \
                     WHERE user_id = ?",
                )
                .bind(uid)
                .execute(&mut *tx)
                .await?;
            }

            if mode == GameMode::Ranked {
                if let Some(rating) = o.rating {
                    let d = difficulty.as_str();
                    let sql = format!(
                        "UPDATE user_stats SET \
                         {d}_rating = ?1, \
                         {d}_peak_rating = MAX({d}_peak_rating, ?1), \
                         {d}_ranked_games = {d}_ranked_games + 1, \
                         {d}_ranked_wins = {d}_ranked_wins + ?2 \
                         WHERE user_id = ?3"
                    );
                    sqlx::query(&sql)
                        .bind(rating.new_rating as i64)
                        .bind(if won { 1i64 } else { 0i64 })
                        .bind(uid)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await
    }

    pub async fn game_results_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<GameResultRow>, sqlx::Error> {
        sqlx::query_as::<_, GameResultRow>(
            "SELECT * FROM game_results WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn game_results_for_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<GameResultRow>, sqlx::Error> {
        sqlx::query_as::<_, GameResultRow>(
            "SELECT * FROM game_results WHERE room_id = ? ORDER BY placement",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
    }

    // ── Refresh tokens ────────────────────────────────────────────────

    pub async fn insert_refresh_token(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, user_id, expires_at) VALUES (?, ?, ?)",
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRow>, sqlx::Error> {
        sqlx::query_as::<_, RefreshTokenRow>(
            "SELECT token_hash, user_id, expires_at, revoked_at FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = datetime('now') WHERE token_hash = ? AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
