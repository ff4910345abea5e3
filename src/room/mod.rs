// Room lifecycle: code validation, registry, and per-room actor plumbing.

pub mod actor;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use crate::db::{Database, GameMode};
use crate::problems::{DifficultyFilter, ProblemStore};

pub use actor::{ClientHandle, JoinReply, Phase, RoomHandle, RoomSnapshot, OUTBOUND_QUEUE};

// ── Room codes ────────────────────────────────────────────────────────

lazy_static! {
    static ref ROOM_CODE_RE: Regex = Regex::new(r"^[A-Z]+-[A-Z]+-\d{4}$").unwrap();
}

const CODE_ADJECTIVES: &[&str] = &[
    "SWIFT", "BRAVE", "CLEVER", "MIGHTY", "RAPID", "SILENT", "BOLD", "KEEN",
    "NIMBLE", "FIERCE", "CALM", "WILD", "SHARP", "LUCKY", "EPIC", "PRIME",
];

const CODE_NOUNS: &[&str] = &[
    "CODER", "HACKER", "WIZARD", "NINJA", "PILOT", "TIGER", "FALCON", "PANDA",
    "ROBOT", "COMET", "ROCKET", "KERNEL", "CURSOR", "LAMBDA", "VECTOR", "PIXEL",
];

/// True when `code` has the canonical `WORD-WORD-DDDD` shape.
pub fn is_valid_room_code(code: &str) -> bool {
    ROOM_CODE_RE.is_match(code)
}

/// Generate a fresh `WORD-WORD-DDDD` room code.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    let adjective = CODE_ADJECTIVES.choose(&mut rng).unwrap();
    let noun = CODE_NOUNS.choose(&mut rng).unwrap();
    let digits: u16 = rng.gen_range(0..10000);
    format!("{adjective}-{noun}-{digits:04}")
}

// ── Room parameters ───────────────────────────────────────────────────

/// Parameters a room is created with, taken from the first player socket.
#[derive(Debug, Clone, Copy)]
pub struct RoomParams {
    pub mode: GameMode,
    pub difficulty: DifficultyFilter,
    pub required_players: usize,
}

impl RoomParams {
    pub const MIN_PLAYERS: usize = 2;
    pub const MAX_PLAYERS: usize = 4;

    pub fn new(mode: GameMode, difficulty: DifficultyFilter, required_players: usize) -> Self {
        Self {
            mode,
            difficulty,
            required_players: required_players.clamp(Self::MIN_PLAYERS, Self::MAX_PLAYERS),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Shared services handed to every room actor.
#[derive(Clone)]
pub(crate) struct RoomDeps {
    pub db: Arc<Database>,
    pub problems: Arc<ProblemStore>,
    pub registry: Weak<RoomRegistry>,
}

/// Map of live rooms. Creation is check-then-insert under one mutex so two
/// sockets racing on the same code always land in the same room.
pub struct RoomRegistry {
    db: Arc<Database>,
    problems: Arc<ProblemStore>,
    rooms: Mutex<HashMap<String, RoomHandle>>,
}

impl RoomRegistry {
    pub fn new(db: Arc<Database>, problems: Arc<ProblemStore>) -> Arc<Self> {
        Arc::new(Self {
            db,
            problems,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, code: &str) -> Option<RoomHandle> {
        self.rooms.lock().unwrap().get(code).cloned()
    }

    /// Fetch the room for `code`, creating it with `params` if absent.
    /// Callers must have validated the code shape first.
    pub fn get_or_create(self: &Arc<Self>, code: &str, params: RoomParams) -> RoomHandle {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(handle) = rooms.get(code) {
            return handle.clone();
        }
        let deps = RoomDeps {
            db: self.db.clone(),
            problems: self.problems.clone(),
            registry: Arc::downgrade(self),
        };
        let handle = actor::spawn_room(code.to_string(), params, deps);
        rooms.insert(code.to_string(), handle.clone());
        handle
    }

    pub fn remove(&self, code: &str) {
        self.rooms.lock().unwrap().remove(code);
    }

    pub fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.lock().unwrap().is_empty()
    }
}
