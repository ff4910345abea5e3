// Matchmaking queue: FIFO per (difficulty, mode), pairing the two oldest
// compatible waiters into a freshly coded room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::db::{Difficulty, GameMode};
use crate::metrics;
use crate::problems::DifficultyFilter;
use crate::room::generate_room_code;

#[derive(Debug, Clone)]
struct QueueEntry {
    connection_id: String,
    username: String,
    difficulty: DifficultyFilter,
    mode: GameMode,
    enqueued_at: Instant,
}

/// Assignment produced for one side of a matched pair.
#[derive(Debug, Clone, Serialize)]
pub struct MatchInfo {
    pub room_code: String,
    pub opponent: String,
    pub difficulty: Difficulty,
    pub mode: GameMode,
}

/// Queue status for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub in_queue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub queue_size: usize,
    pub match_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_info: Option<MatchInfo>,
}

struct Inner {
    /// FIFO: entries are appended on join and scanned oldest-first.
    queue: Vec<QueueEntry>,
    /// Matches produced but not yet collected via `status`.
    pending: HashMap<String, MatchInfo>,
}

/// Shared matchmaker. One coarse lock; entries are few and short-lived.
#[derive(Clone)]
pub struct Matchmaker {
    inner: Arc<Mutex<Inner>>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: Vec::new(),
                pending: HashMap::new(),
            })),
        }
    }

    /// Enqueue a player. Idempotent per connection: a re-join replaces the
    /// previous entry (and its queue position). Returns the queue size.
    pub fn join(
        &self,
        connection_id: &str,
        username: &str,
        difficulty: DifficultyFilter,
        mode: GameMode,
    ) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.retain(|e| e.connection_id != connection_id);
        inner.queue.push(QueueEntry {
            connection_id: connection_id.to_string(),
            username: username.to_string(),
            difficulty,
            mode,
            enqueued_at: Instant::now(),
        });
        Self::try_match(&mut inner);
        metrics::MATCHMAKING_QUEUE_DEPTH.set(inner.queue.len() as i64);
        inner.queue.len()
    }

    /// Remove a connection from the queue. Idempotent.
    pub fn leave(&self, connection_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.queue.len();
        inner.queue.retain(|e| e.connection_id != connection_id);
        metrics::MATCHMAKING_QUEUE_DEPTH.set(inner.queue.len() as i64);
        inner.queue.len() != before
    }

    /// Current status for a connection. A produced match is reported exactly
    /// once; the entry is cleared by this call.
    pub fn status(&self, connection_id: &str) -> QueueStatus {
        let mut inner = self.inner.lock().unwrap();
        let queue_size = inner.queue.len();

        if let Some(info) = inner.pending.remove(connection_id) {
            return QueueStatus {
                in_queue: false,
                position: None,
                queue_size,
                match_found: true,
                match_info: Some(info),
            };
        }

        let position = inner
            .queue
            .iter()
            .position(|e| e.connection_id == connection_id)
            .map(|i| i + 1);
        QueueStatus {
            in_queue: position.is_some(),
            position,
            queue_size,
            match_found: false,
            match_info: None,
        }
    }

    /// Run one matching pass (also called opportunistically on every join).
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::try_match(&mut inner);
        metrics::MATCHMAKING_QUEUE_DEPTH.set(inner.queue.len() as i64);
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Pair the oldest two compatible waiters until no pair remains.
    ///
    /// Compatible: same mode, different username, and difficulties that agree
    /// once `Any` is resolved. The older waiter's concrete choice wins;
    /// two `Any` entries land on Medium.
    fn try_match(inner: &mut Inner) {
        loop {
            let mut matched: Option<(usize, usize)> = None;
            'outer: for i in 0..inner.queue.len() {
                for j in (i + 1)..inner.queue.len() {
                    let (a, b) = (&inner.queue[i], &inner.queue[j]);
                    if a.mode != b.mode || a.username == b.username {
                        continue;
                    }
                    let compatible = match (a.difficulty.level(), b.difficulty.level()) {
                        (Some(da), Some(db)) => da == db,
                        _ => true,
                    };
                    if compatible {
                        matched = Some((i, j));
                        break 'outer;
                    }
                }
            }

            let Some((i, j)) = matched else { break };
            // Remove the later entry first so the earlier index stays valid.
            let b = inner.queue.remove(j);
            let a = inner.queue.remove(i);

            let difficulty = a
                .difficulty
                .level()
                .or(b.difficulty.level())
                .unwrap_or(Difficulty::Medium);
            let room_code = generate_room_code();
            let waited = a.enqueued_at.elapsed();
            tracing::info!(
                room = %room_code,
                %difficulty,
                mode = %a.mode,
                waited_ms = waited.as_millis() as u64,
                "matched {} vs {}",
                a.username,
                b.username
            );

            inner.pending.insert(
                a.connection_id.clone(),
                MatchInfo {
                    room_code: room_code.clone(),
                    opponent: b.username.clone(),
                    difficulty,
                    mode: a.mode,
                },
            );
            inner.pending.insert(
                b.connection_id.clone(),
                MatchInfo {
                    room_code,
                    opponent: a.username.clone(),
                    difficulty,
                    mode: a.mode,
                },
            );
            metrics::MATCHES_CREATED_TOTAL.inc();
        }
    }
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background task that retries matching on a timer, catching
/// waiters whose partner joined through a different code path.
pub fn spawn_matchmaker_worker(matchmaker: Matchmaker, interval_ms: u64) {
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_millis(interval_ms);
        loop {
            tokio::time::sleep(period).await;
            matchmaker.tick();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy() -> DifficultyFilter {
        DifficultyFilter::Level(Difficulty::Easy)
    }

    #[test]
    fn test_join_and_match_same_difficulty() {
        let mm = Matchmaker::new();
        assert_eq!(mm.join("c1", "alice", easy(), GameMode::Casual), 1);
        assert_eq!(mm.join("c2", "bob", easy(), GameMode::Casual), 0);

        let s1 = mm.status("c1");
        assert!(s1.match_found);
        let info1 = s1.match_info.unwrap();
        assert_eq!(info1.opponent, "bob");
        assert_eq!(info1.difficulty, Difficulty::Easy);

        let s2 = mm.status("c2");
        assert!(s2.match_found);
        let info2 = s2.match_info.unwrap();
        assert_eq!(info2.opponent, "alice");
        assert_eq!(info2.room_code, info1.room_code);
        assert!(crate::room::is_valid_room_code(&info1.room_code));
    }

    #[test]
    fn test_match_reported_exactly_once() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c2", "bob", easy(), GameMode::Casual);

        assert!(mm.status("c1").match_found);
        // Second poll: entry is cleared
        let again = mm.status("c1");
        assert!(!again.match_found);
        assert!(!again.in_queue);
    }

    #[test]
    fn test_no_match_across_modes_or_difficulties() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c2", "bob", easy(), GameMode::Ranked);
        mm.join("c3", "carol", DifficultyFilter::Level(Difficulty::Hard), GameMode::Casual);

        assert!(!mm.status("c1").match_found);
        assert!(!mm.status("c2").match_found);
        assert!(!mm.status("c3").match_found);
        assert_eq!(mm.queue_len(), 3);
    }

    #[test]
    fn test_any_resolves_to_oldest_concrete_choice() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", DifficultyFilter::Level(Difficulty::Hard), GameMode::Casual);
        mm.join("c2", "bob", DifficultyFilter::Any, GameMode::Casual);

        let info = mm.status("c1").match_info.unwrap();
        assert_eq!(info.difficulty, Difficulty::Hard);
    }

    #[test]
    fn test_two_any_entries_land_on_medium() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", DifficultyFilter::Any, GameMode::Ranked);
        mm.join("c2", "bob", DifficultyFilter::Any, GameMode::Ranked);

        let info = mm.status("c2").match_info.unwrap();
        assert_eq!(info.difficulty, Difficulty::Medium);
        assert_eq!(info.mode, GameMode::Ranked);
    }

    #[test]
    fn test_same_username_never_matches_itself() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c2", "alice", easy(), GameMode::Casual);

        assert!(!mm.status("c1").match_found);
        assert!(!mm.status("c2").match_found);
    }

    #[test]
    fn test_rejoin_replaces_entry() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c1", "alice", DifficultyFilter::Level(Difficulty::Hard), GameMode::Casual);
        assert_eq!(mm.queue_len(), 1);

        mm.join("c2", "bob", DifficultyFilter::Level(Difficulty::Hard), GameMode::Casual);
        let info = mm.status("c1").match_info.unwrap();
        assert_eq!(info.difficulty, Difficulty::Hard);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        assert!(mm.leave("c1"));
        assert!(!mm.leave("c1"));
        assert_eq!(mm.queue_len(), 0);
    }

    #[test]
    fn test_oldest_pair_matches_first() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c2", "bob", DifficultyFilter::Level(Difficulty::Hard), GameMode::Casual);
        mm.join("c3", "carol", easy(), GameMode::Casual);

        // alice+carol pair on easy; bob keeps waiting
        assert_eq!(mm.status("c1").match_info.unwrap().opponent, "carol");
        let s2 = mm.status("c2");
        assert!(s2.in_queue);
        assert_eq!(s2.position, Some(1));
    }

    #[test]
    fn test_position_reflects_fifo_order() {
        let mm = Matchmaker::new();
        mm.join("c1", "alice", easy(), GameMode::Casual);
        mm.join("c2", "bob", DifficultyFilter::Level(Difficulty::Hard), GameMode::Ranked);

        assert_eq!(mm.status("c1").position, Some(1));
        assert_eq!(mm.status("c2").position, Some(2));
    }
}
