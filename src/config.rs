// Application configuration, loaded from environment variables.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub db_url: String,
    /// Port to bind the HTTP server to.
    pub server_port: u16,
    /// Allowed browser origin for CORS. `None` means permissive (dev mode).
    pub frontend_origin: Option<String>,
    /// Container image used for sandboxed submission runs.
    pub sandbox_image: String,
    /// Maximum concurrent sandbox invocations.
    pub sandbox_concurrency: usize,
    /// Secret for signing access tokens.
    pub jwt_secret: String,
    /// Directory containing problem JSON files.
    pub problems_dir: PathBuf,
    /// Inbound `code_change` events allowed per socket per second.
    pub code_change_rate: usize,
}

/// A configuration value that could not be parsed. Fatal at startup.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `DB_URL` - SQLite connection string (default: `sqlite:bitbattle.db?mode=rwc`)
    /// - `SERVER_PORT` - HTTP server port (default: 4000)
    /// - `FRONTEND_ORIGIN` - exact origin allowed by CORS (default: any)
    /// - `SANDBOX_IMAGE` - container image for submission runs
    /// - `SANDBOX_CONCURRENCY` - max concurrent sandbox runs (default: min(cpus, 8))
    /// - `JWT_SECRET` - access token signing secret
    /// - `PROBLEMS_DIR` - path to the problem files (default: `./data/problems`)
    /// - `CODE_CHANGE_RATE` - per-socket code_change events per second (default: 20)
    pub fn load() -> Result<Self, ConfigError> {
        let db_url = std::env::var("DB_URL")
            .unwrap_or_else(|_| "sqlite:bitbattle.db?mode=rwc".to_string());

        let server_port = parse_env("SERVER_PORT", 4000)?;

        let frontend_origin = std::env::var("FRONTEND_ORIGIN").ok().filter(|v| !v.is_empty());

        let sandbox_image = std::env::var("SANDBOX_IMAGE")
            .unwrap_or_else(|_| "bitbattle-sandbox:latest".to_string());

        let sandbox_concurrency =
            parse_env("SANDBOX_CONCURRENCY", num_cpus::get().min(8).max(1))?;

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "bitbattle-dev-secret-change-in-production".to_string());

        let problems_dir = std::env::var("PROBLEMS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/problems"));

        let code_change_rate = parse_env("CODE_CHANGE_RATE", 20)?;

        Ok(Config {
            db_url,
            server_port,
            frontend_origin,
            sandbox_image,
            sandbox_concurrency,
            jwt_secret,
            problems_dir,
            code_change_rate,
        })
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Global `code_change` rate, set once at startup and read by the WS layer.
static CODE_CHANGE_RATE: AtomicUsize = AtomicUsize::new(20);

/// Set the global `code_change` rate (called once at startup).
pub fn set_code_change_rate(per_second: usize) {
    CODE_CHANGE_RATE.store(per_second, Ordering::Relaxed);
}

/// Current `code_change` events allowed per socket per second.
pub fn code_change_rate() -> usize {
    CODE_CHANGE_RATE.load(Ordering::Relaxed)
}
