// Problem repository: loads problem JSON files at startup and picks one per game.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::db::Difficulty;

/// One test case. `examples` entries are shown to clients; hidden tests never
/// leave the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub examples: Vec<TestCase>,
    pub hidden_tests: Vec<TestCase>,
    #[serde(default)]
    pub starter_code: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
}

/// Client-facing view of a problem: everything except the hidden tests.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub examples: Vec<TestCase>,
    pub starter_code: HashMap<String, String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_minutes: Option<u32>,
}

impl Problem {
    pub fn view(&self) -> ProblemView {
        ProblemView {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            difficulty: self.difficulty,
            examples: self.examples.clone(),
            starter_code: self.starter_code.clone(),
            tags: self.tags.clone(),
            time_limit_minutes: self.time_limit_minutes,
        }
    }
}

/// Difficulty filter used by rooms and the matchmaker. `Any` matches all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyFilter {
    Any,
    #[serde(untagged)]
    Level(Difficulty),
}

impl DifficultyFilter {
    pub fn matches(self, difficulty: Difficulty) -> bool {
        match self {
            DifficultyFilter::Any => true,
            DifficultyFilter::Level(d) => d == difficulty,
        }
    }

    /// The concrete difficulty, if this filter names one.
    pub fn level(self) -> Option<Difficulty> {
        match self {
            DifficultyFilter::Any => None,
            DifficultyFilter::Level(d) => Some(d),
        }
    }
}

impl std::str::FromStr for DifficultyFilter {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s.eq_ignore_ascii_case("any") {
            Ok(DifficultyFilter::Any)
        } else {
            s.parse().map(DifficultyFilter::Level)
        }
    }
}

impl std::fmt::Display for DifficultyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyFilter::Any => f.write_str("any"),
            DifficultyFilter::Level(d) => f.write_str(d.as_str()),
        }
    }
}

/// Warm in-memory problem cache, loaded once at startup. Problems are
/// immutable for the lifetime of the process.
pub struct ProblemStore {
    problems: Vec<Problem>,
    by_id: HashMap<String, usize>,
}

impl ProblemStore {
    /// Scan a directory for `*.json` problem files.
    ///
    /// Unreadable or malformed files are skipped with a warning so one bad
    /// file cannot take the service down.
    pub fn load(problems_dir: &Path) -> Result<Self, String> {
        let entries = std::fs::read_dir(problems_dir)
            .map_err(|e| format!("failed to read problems dir '{}': {e}", problems_dir.display()))?;

        let mut problems = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("skipping unreadable problem file {}: {e}", path.display());
                    continue;
                }
            };
            match serde_json::from_str::<Problem>(&contents) {
                Ok(p) => problems.push(p),
                Err(e) => {
                    tracing::warn!("skipping malformed problem file {}: {e}", path.display());
                }
            }
        }

        if problems.is_empty() {
            return Err(format!(
                "no problems found in '{}'",
                problems_dir.display()
            ));
        }

        problems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self::from_problems(problems))
    }

    pub fn from_problems(problems: Vec<Problem>) -> Self {
        let by_id = problems
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self { problems, by_id }
    }

    pub fn get(&self, id: &str) -> Option<&Problem> {
        self.by_id.get(id).map(|&i| &self.problems[i])
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// All problems, for the listing endpoint.
    pub fn all(&self) -> &[Problem] {
        &self.problems
    }

    /// Pick a problem uniformly at random among those matching `filter` and
    /// not in `excluding`. Falls back to the full filter-matching set when
    /// the exclusion empties it.
    pub fn choose(&self, filter: DifficultyFilter, excluding: &HashSet<String>) -> Option<&Problem> {
        let matching: Vec<&Problem> = self
            .problems
            .iter()
            .filter(|p| filter.matches(p.difficulty))
            .collect();

        let fresh: Vec<&Problem> = matching
            .iter()
            .copied()
            .filter(|p| !excluding.contains(&p.id))
            .collect();

        let pool = if fresh.is_empty() { &matching } else { &fresh };
        pool.choose(&mut rand::thread_rng()).copied()
    }
}
