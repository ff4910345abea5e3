// Prometheus metrics definitions for the BitBattle backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Rooms currently alive (any phase).
    pub static ref ACTIVE_ROOMS: IntGauge =
        IntGauge::new("bitbattle_active_rooms", "Rooms currently alive").unwrap();

    /// Live WebSocket connections (participants + spectators).
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("bitbattle_connected_websockets", "Live WebSocket connections").unwrap();

    /// Players waiting in the matchmaking queue.
    pub static ref MATCHMAKING_QUEUE_DEPTH: IntGauge =
        IntGauge::new("bitbattle_matchmaking_queue_depth", "Players waiting for a match").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total games started, by mode (casual, ranked).
    pub static ref GAMES_STARTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bitbattle_games_started_total", "Total games started"),
        &["mode"],
    )
    .unwrap();

    /// Total games that ended with a winner, by mode.
    pub static ref GAMES_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bitbattle_games_completed_total", "Total games completed"),
        &["mode"],
    )
    .unwrap();

    /// Total games abandoned before a winner emerged.
    pub static ref GAMES_ABANDONED_TOTAL: IntCounter = IntCounter::new(
        "bitbattle_games_abandoned_total",
        "Games abandoned before completion",
    )
    .unwrap();

    /// Total submissions judged, by language and outcome.
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bitbattle_submissions_total", "Total submissions judged"),
        &["language", "outcome"],
    )
    .unwrap();

    /// Total sandbox invocations, by language.
    pub static ref SANDBOX_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bitbattle_sandbox_runs_total", "Total sandbox invocations"),
        &["language"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bitbattle_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    /// Total WebSocket frames sent to clients.
    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "bitbattle_websocket_messages_sent_total",
        "Total WebSocket frames sent",
    )
    .unwrap();

    /// Frames dropped because a client's outbound queue overflowed.
    pub static ref WEBSOCKET_MESSAGES_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "bitbattle_websocket_messages_dropped_total",
        "Frames dropped due to slow clients",
    )
    .unwrap();

    /// Matches produced by the matchmaker.
    pub static ref MATCHES_CREATED_TOTAL: IntCounter = IntCounter::new(
        "bitbattle_matches_created_total",
        "Pairs produced by the matchmaker",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Wall time of one sandbox invocation in milliseconds.
    pub static ref SANDBOX_DURATION_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new("bitbattle_sandbox_duration_ms", "Sandbox invocation wall time in ms")
            .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
    )
    .unwrap();

    /// Winner solve time in seconds, by mode.
    pub static ref SOLVE_TIME_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("bitbattle_solve_time_seconds", "Winning solve time in seconds")
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0]),
        &["mode"],
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "bitbattle_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_ROOMS.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(MATCHMAKING_QUEUE_DEPTH.clone()),
        Box::new(GAMES_STARTED_TOTAL.clone()),
        Box::new(GAMES_COMPLETED_TOTAL.clone()),
        Box::new(GAMES_ABANDONED_TOTAL.clone()),
        Box::new(SUBMISSIONS_TOTAL.clone()),
        Box::new(SANDBOX_RUNS_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_DROPPED_TOTAL.clone()),
        Box::new(MATCHES_CREATED_TOTAL.clone()),
        Box::new(SANDBOX_DURATION_MS.clone()),
        Box::new(SOLVE_TIME_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        REGISTRY.register(c).expect("failed to register metric");
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Normalize a URL path for metric labels: numeric segments and room codes
/// collapse to placeholders to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else if crate::room::is_valid_room_code(segment) {
                ":code"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_plain() {
        assert_eq!(normalize_path("/rooms/live"), "/rooms/live");
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn test_normalize_path_ids_and_codes() {
        assert_eq!(normalize_path("/problems/42"), "/problems/:id");
        assert_eq!(
            normalize_path("/rooms/SWIFT-CODER-1234"),
            "/rooms/:code"
        );
    }

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("bitbattle_"));
    }

    #[test]
    fn test_metric_increments() {
        ACTIVE_ROOMS.set(2);
        assert_eq!(ACTIVE_ROOMS.get(), 2);
        ACTIVE_ROOMS.set(0);

        CONNECTED_WEBSOCKETS.inc();
        CONNECTED_WEBSOCKETS.dec();

        GAMES_STARTED_TOTAL.with_label_values(&["casual"]).inc();
        GAMES_COMPLETED_TOTAL.with_label_values(&["ranked"]).inc();
        GAMES_ABANDONED_TOTAL.inc();

        SUBMISSIONS_TOTAL
            .with_label_values(&["python", "passed"])
            .inc();
        SANDBOX_RUNS_TOTAL.with_label_values(&["rust"]).inc();

        SANDBOX_DURATION_MS.observe(150.0);
        SOLVE_TIME_SECONDS.with_label_values(&["casual"]).observe(42.0);
        API_REQUEST_DURATION_SECONDS
            .with_label_values(&["/submit"])
            .observe(0.2);
    }
}
