// Sandboxed execution of untrusted submissions.
//
// One container per invocation via the docker CLI: no network, 128 MiB memory,
// half a core, 50 pids, read-only rootfs with a private /tmp, unprivileged uid.
// Process-level isolation with equivalent limits would also satisfy the
// contract; the docker image is the deployment default.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Wall-clock limit for one sandbox invocation.
pub const WALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a queued invocation may wait for a free sandbox slot.
pub const QUEUE_DEADLINE: Duration = Duration::from_secs(30);

const MEMORY_LIMIT: &str = "128m";
const CPU_LIMIT: &str = "0.5";
const PIDS_LIMIT: &str = "50";
const SANDBOX_UID: &str = "65534:65534";

/// Languages accepted by the submission endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    Python,
    Java,
    C,
    Cpp,
    Rust,
    Go,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Go => "go",
        }
    }

    /// File name the source is written to inside the scratch directory,
    /// mounted read-only at /box.
    pub fn source_file(self) -> &'static str {
        match self {
            Language::JavaScript => "main.js",
            Language::Python => "main.py",
            Language::Java => "Main.java",
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
            Language::Rust => "main.rs",
            Language::Go => "main.go",
        }
    }

    /// Shell command run inside the container. Compiled languages build into
    /// the tmpfs /tmp and run from there; compiler diagnostics land on stderr.
    pub fn command(self) -> &'static str {
        match self {
            Language::JavaScript => "node /box/main.js",
            Language::Python => "python3 /box/main.py",
            Language::Java => {
                "cp /box/Main.java /tmp && cd /tmp && javac Main.java && java -Xmx96m Main"
            }
            Language::C => "gcc -O2 /box/main.c -o /tmp/prog && /tmp/prog",
            Language::Cpp => "g++ -O2 /box/main.cpp -o /tmp/prog && /tmp/prog",
            Language::Rust => "rustc -O /box/main.rs -o /tmp/prog && /tmp/prog",
            Language::Go => "cd /tmp && cp /box/main.go . && go run main.go",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "rust" => Ok(Language::Rust),
            "go" | "golang" => Ok(Language::Go),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sandbox invocation.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub oom: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox queue deadline exceeded")]
    QueueTimeout,
    #[error("failed to prepare sandbox workspace: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Stateless, reentrant sandbox runner. Concurrency is bounded by a fair
/// semaphore so queued invocations start in FIFO order.
pub struct Sandbox {
    image: String,
    slots: Arc<Semaphore>,
}

impl Sandbox {
    pub fn new(image: impl Into<String>, concurrency: usize) -> Self {
        Self {
            image: image.into(),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run `source` against `stdin` and collect output.
    ///
    /// The permit is held for the duration of the child process and released
    /// on every exit path, including cancellation of the calling task.
    pub async fn run(
        &self,
        language: Language,
        source: &str,
        stdin: &str,
        wall_timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let _permit = tokio::time::timeout(QUEUE_DEADLINE, self.slots.acquire())
            .await
            .map_err(|_| SandboxError::QueueTimeout)?
            .expect("sandbox semaphore closed");

        crate::metrics::SANDBOX_RUNS_TOTAL
            .with_label_values(&[language.as_str()])
            .inc();

        let workspace = tempfile::tempdir()?;
        std::fs::write(workspace.path().join(language.source_file()), source)?;

        let container_name = format!("bitbattle-run-{}", uuid::Uuid::new_v4());
        let start = Instant::now();

        let mut child = self
            .docker_command(language, workspace.path(), &container_name)
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            // A closed pipe just means the child exited before reading.
            let _ = pipe.write_all(stdin.as_bytes()).await;
            let _ = pipe.shutdown().await;
        }

        let stdout_task = read_pipe(child.stdout.take());
        let stderr_task = read_pipe(child.stderr.take());

        let (timed_out, exit_code) = match tokio::time::timeout(wall_timeout, child.wait()).await {
            Ok(Ok(status)) => (false, status.code().unwrap_or(-1)),
            Ok(Err(e)) => {
                tracing::error!("sandbox wait failed: {e}");
                (false, -1)
            }
            Err(_) => {
                // Kill both the CLI client and the container itself.
                let _ = child.start_kill();
                let _ = Command::new("docker")
                    .args(["kill", &container_name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                let _ = child.wait().await;
                (true, -1)
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        crate::metrics::SANDBOX_DURATION_MS.observe(duration_ms as f64);

        Ok(SandboxOutput {
            stdout,
            stderr,
            exit_code,
            duration_ms,
            // 137 = SIGKILL from the kernel OOM killer under --memory.
            oom: !timed_out && exit_code == 137,
            timed_out,
        })
    }

    fn docker_command(&self, language: Language, workspace: &Path, name: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .args(["--rm", "-i"])
            .args(["--name", name])
            .args(["--network", "none"])
            .args(["--memory", MEMORY_LIMIT])
            .args(["--memory-swap", MEMORY_LIMIT])
            .args(["--cpus", CPU_LIMIT])
            .args(["--pids-limit", PIDS_LIMIT])
            .arg("--read-only")
            .args(["--tmpfs", "/tmp:rw,exec,size=256m"])
            .args(["-v", &format!("{}:/box:ro", workspace.display())])
            .args(["-u", SANDBOX_UID])
            .args(["-e", "HOME=/tmp"])
            .args(["-e", "GOCACHE=/tmp/.gocache"])
            .arg(&self.image)
            .args(["sh", "-c", language.command()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Drain a child pipe into a string on a background task so a timed-out
/// child's partial stdout is preserved.
fn read_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            use tokio::io::AsyncReadExt;
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    })
}
