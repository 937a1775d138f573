//! HTTP server startup and background tasks.
//!
//! All handlers share one [`UnifiedAppState`]; the scheduler loop and the
//! retention sweep run beside the listener and stop with it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use tokio::sync::{broadcast, watch};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    api,
    config::Config,
    memory_db::MemoryDatabase,
    model_runtime::BackendRouter,
    shared_state::{SharedSystemState, UnifiedAppState},
    utils::TextUtils,
};

const MAX_IN_FLIGHT_REQUESTS: usize = 64;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let retention_days = cfg.session_retention_days;

    if let Some(parent) = cfg.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let database = Arc::new(MemoryDatabase::new(&cfg.db_path)?);
    info!("Memory database initialized at: {}", cfg.db_path.display());

    // The engine itself is loaded lazily on the first generation.
    let router = Arc::new(BackendRouter::from_config(&cfg)?);
    let request_timeout = request_timeout(&cfg);
    let shared_state = Arc::new(SharedSystemState::new(cfg, database, Arc::clone(&router))?);
    let state = UnifiedAppState::new(Arc::clone(&shared_state));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::clone(&shared_state.scheduler);
    let log_rx = scheduler.subscribe();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    let delivery_log_task = tokio::spawn(log_deliveries(log_rx));
    let cleanup_task = tokio::spawn(cleanup_loop(
        Arc::clone(&shared_state),
        retention_days,
        shutdown_rx,
    ));

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state, request_timeout);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down background tasks");
    shutdown_tx.send(true).ok();
    for task in [scheduler_task, cleanup_task] {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    delivery_log_task.abort();
    router.unload().await;

    served?;
    Ok(())
}

/// A chat request may wait for the slot and then generate, with a margin
/// for the summarizer pass that follows.
fn request_timeout(cfg: &Config) -> Duration {
    Duration::from_secs(
        cfg.slot_wait_timeout_seconds + cfg.load_timeout_seconds + cfg.generate_timeout_seconds * 2 + 30,
    )
}

pub fn build_router(state: UnifiedAppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/sessions", post(api::create_session).get(api::list_sessions))
        .route("/sessions/:id", delete(api::delete_session))
        .route(
            "/sessions/:id/messages",
            get(api::get_history).post(api::send_message),
        )
        .route("/sessions/:id/export", get(api::export_session))
        .route("/sessions/:id/archive", post(api::archive_session))
        .route("/schedules", post(api::create_schedule).get(api::list_schedules))
        .route(
            "/schedules/:id",
            put(api::update_schedule).delete(api::delete_schedule),
        )
        .route("/schedules/:id/enabled", post(api::set_schedule_enabled))
        .route("/schedules/:id/trigger", post(api::trigger_schedule))
        .route("/summaries", get(api::list_summaries))
        .route("/memory", get(api::get_memory))
        .route("/healthz", get(api::healthz))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let response = next.run(req).await;
    crate::metrics::inc_request(&route, response.status().as_str());
    response
}

async fn cleanup_loop(shared: Arc<SharedSystemState>, retention_days: i64, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match shared.sessions.cleanup_old_sessions(retention_days) {
                    Ok(0) => {}
                    Ok(n) => info!("Removed {} inactive sessions", n),
                    Err(e) => warn!("Session cleanup failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn log_deliveries(mut rx: broadcast::Receiver<crate::context_engine::ProactiveDelivery>) {
    loop {
        match rx.recv().await {
            Ok(delivery) => {
                info!(
                    "Check-in delivered to {} in session {}{}",
                    delivery.owner_id,
                    delivery.session_id,
                    if delivery.intercepted { " (intercepted)" } else { "" }
                );
                debug!("Check-in text: {}", TextUtils::truncate_with_ellipsis(&delivery.message.content, 80));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Delivery log skipped {} entries", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
