// Submission pipeline: runs a submission against every hidden test and
// aggregates a verdict. Pure with respect to persistence; scoring happens in
// the room's completion path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::problems::Problem;
use crate::sandbox::{Language, Sandbox, SandboxOutput, WALL_TIMEOUT};

/// How long a completed verdict answers duplicate submits (client retries).
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(10);

/// Cap on the compiler/runtime diagnostics echoed back per test.
const MAX_ERROR_LEN: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub passed: bool,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub test_results: Vec<TestResult>,
    pub execution_time_ms: u64,
}

/// Idempotency key for one submit attempt.
type SubmitKey = (String, String, String, String);

pub struct SubmissionPipeline {
    sandbox: Arc<Sandbox>,
    recent: Mutex<HashMap<SubmitKey, (Instant, SubmissionResult)>>,
}

impl SubmissionPipeline {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Run `source` against every hidden test of `problem`, in order.
    ///
    /// Every test is executed and reported even after a failure, so clients
    /// always see full diagnostics. Tests within one submission run
    /// sequentially; concurrency across rooms is bounded by the sandbox.
    pub async fn submit(
        &self,
        username: &str,
        room: &str,
        problem: &Problem,
        language: Language,
        source: &str,
    ) -> SubmissionResult {
        let key = submit_key(username, room, &problem.id, source);
        if let Some(result) = self.cached(&key) {
            tracing::debug!(room, username, "returning cached submission verdict");
            return result;
        }

        let mut test_results = Vec::with_capacity(problem.hidden_tests.len());
        let mut passed_tests = 0;
        let mut execution_time_ms = 0;
        let mut had_error = false;

        for test in &problem.hidden_tests {
            let (actual, time_ms, passed, error) = match self
                .sandbox
                .run(language, source, &test.input, WALL_TIMEOUT)
                .await
            {
                Ok(output) => {
                    let (passed, error) = evaluate(&output, &test.expected_output);
                    (output.stdout, output.duration_ms, passed, error)
                }
                Err(e) => (String::new(), 0, false, Some(e.to_string())),
            };

            execution_time_ms += time_ms;
            if passed {
                passed_tests += 1;
            }
            if error.is_some() {
                had_error = true;
            }
            test_results.push(TestResult {
                input: test.input.clone(),
                expected: test.expected_output.clone(),
                actual,
                passed,
                time_ms,
                error,
            });
        }

        let total_tests = test_results.len();
        let result = SubmissionResult {
            passed: passed_tests == total_tests && total_tests > 0 && !had_error,
            passed_tests,
            total_tests,
            test_results,
            execution_time_ms,
        };

        crate::metrics::SUBMISSIONS_TOTAL
            .with_label_values(&[
                language.as_str(),
                if result.passed { "passed" } else { "failed" },
            ])
            .inc();

        self.remember(key, result.clone());
        result
    }

    fn cached(&self, key: &SubmitKey) -> Option<SubmissionResult> {
        let mut recent = self.recent.lock().unwrap();
        let now = Instant::now();
        recent.retain(|_, (at, _)| now.duration_since(*at) < IDEMPOTENCY_WINDOW);
        recent.get(key).map(|(_, result)| result.clone())
    }

    fn remember(&self, key: SubmitKey, result: SubmissionResult) {
        self.recent
            .lock()
            .unwrap()
            .insert(key, (Instant::now(), result));
    }
}

fn submit_key(username: &str, room: &str, problem_id: &str, source: &str) -> SubmitKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    (
        username.to_string(),
        room.to_string(),
        problem_id.to_string(),
        hex::encode(hasher.finalize()),
    )
}

/// Judge one sandbox run against the expected output.
///
/// Matching is byte-exact on trimmed stdout. Sandbox failures become the
/// per-test `error`, never a transport error.
fn evaluate(output: &SandboxOutput, expected: &str) -> (bool, Option<String>) {
    if output.timed_out {
        return (false, Some("time limit exceeded".to_string()));
    }
    if output.oom {
        return (false, Some("memory limit exceeded".to_string()));
    }
    if output.exit_code != 0 {
        let mut diag = output.stderr.trim().to_string();
        if diag.is_empty() {
            diag = format!("process exited with code {}", output.exit_code);
        }
        diag.truncate(MAX_ERROR_LEN);
        return (false, Some(diag));
    }
    (output.stdout.trim() == expected.trim(), None)
}
