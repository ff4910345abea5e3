use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use bitbattle_backend::api::{self, AppState};
use bitbattle_backend::auth;
use bitbattle_backend::config::{self, Config};
use bitbattle_backend::db::Database;
use bitbattle_backend::matchmaker::{spawn_matchmaker_worker, Matchmaker};
use bitbattle_backend::metrics;
use bitbattle_backend::pipeline::SubmissionPipeline;
use bitbattle_backend::problems::ProblemStore;
use bitbattle_backend::rate_limit::RateLimiter;
use bitbattle_backend::room::RoomRegistry;
use bitbattle_backend::sandbox::Sandbox;

const MATCHMAKER_TICK_MS: u64 = 2000;

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "bitbattle-backend" }))
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::gather_metrics();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

/// Axum middleware that records per-request metrics (count and duration).
async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = metrics::normalize_path(req.uri().path());

    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[&path])
        .observe(elapsed);

    response
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    config::set_code_change_rate(cfg.code_change_rate);

    let db = match Database::new(&cfg.db_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("failed to initialize database: {e}");
            std::process::exit(1);
        }
    };

    let problems = match ProblemStore::load(&cfg.problems_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to load problems: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "loaded {} problems from {}",
        problems.len(),
        cfg.problems_dir.display()
    );

    let sandbox = Arc::new(Sandbox::new(cfg.sandbox_image.clone(), cfg.sandbox_concurrency));
    tracing::info!(
        image = %cfg.sandbox_image,
        concurrency = cfg.sandbox_concurrency,
        "sandbox runner ready"
    );

    let rooms = RoomRegistry::new(db.clone(), problems.clone());
    let matchmaker = Matchmaker::new();
    spawn_matchmaker_worker(matchmaker.clone(), MATCHMAKER_TICK_MS);

    let state = AppState {
        db: db.clone(),
        problems,
        rooms,
        matchmaker,
        pipeline: Arc::new(SubmissionPipeline::new(sandbox)),
        rate_limiter: RateLimiter::new(),
    };

    // CORS: locked to the configured frontend origin, permissive in dev.
    let cors = match cfg.frontend_origin.as_deref() {
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin(value)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => {
                tracing::error!("configuration error: FRONTEND_ORIGIN is not a valid origin");
                std::process::exit(1);
            }
        },
        None => CorsLayer::permissive(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/auth/refresh", post(auth::refresh))
        .with_state(db)
        .merge(api::router(state))
        .layer(cors)
        .layer(axum::middleware::from_fn(metrics_middleware));

    let addr = format!("0.0.0.0:{}", cfg.server_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("BitBattle backend listening on port {}", cfg.server_port);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
