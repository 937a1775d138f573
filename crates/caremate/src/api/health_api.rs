use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::memory_db::DatabaseStats;
use crate::model_runtime::RuntimeMetadata;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: String,
    pub engine: String,
    pub model_loaded: bool,
    pub runtime: Option<RuntimeMetadata>,
    pub stats: Option<DatabaseStats>,
}

/// Reports 200 while storage answers. An unloaded engine is normal
/// (it loads on first use), a failing one degrades the status.
pub async fn healthz(State(state): State<UnifiedAppState>) -> (StatusCode, Json<HealthResponse>) {
    let shared = &state.shared_state;
    let database = match shared.database.ping() {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    let (engine, engine_ok) = match shared.router.health_check().await {
        Ok(s) => (s, true),
        Err(e) => (e.to_string(), false),
    };
    let db_ok = database == "ok";
    let status = match (db_ok, engine_ok) {
        (true, true) => "ok",
        (true, false) => "degraded",
        _ => "unavailable",
    };
    let code = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        code,
        Json(HealthResponse {
            status,
            database,
            engine,
            model_loaded: shared.router.is_loaded(),
            runtime: shared.router.metadata(),
            stats: shared.database.get_stats().ok(),
        }),
    )
}
