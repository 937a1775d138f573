//! Schedule, summary and long-term memory endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::error::ApiResult;
use super::session_api::OwnerQuery;
use crate::context_engine::ProactiveDelivery;
use crate::memory_db::{OwnerMemory, ScheduleEntry, Summary};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub owner_id: String,
    /// `HH:MM` or a five-field cron expression.
    pub trigger: String,
    /// IANA name; the configured default when absent.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub owner_id: String,
    pub enabled: bool,
}

/// Fields left out keep their current value.
#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub owner_id: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn create_schedule(
    State(state): State<UnifiedAppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<ScheduleEntry>)> {
    let entry = state
        .scheduler()
        .create_schedule(&req.owner_id, &req.trigger, req.timezone.as_deref())?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn list_schedules(
    State(state): State<UnifiedAppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<ScheduleEntry>>> {
    Ok(Json(state.scheduler().list_schedules(&query.owner_id)?))
}

pub async fn set_schedule_enabled(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> ApiResult<Json<ScheduleEntry>> {
    Ok(Json(state.scheduler().set_enabled(&req.owner_id, &id, req.enabled)?))
}

pub async fn update_schedule(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<ScheduleEntry>> {
    let entry = state.scheduler().update_schedule(
        &req.owner_id,
        &id,
        req.trigger.as_deref(),
        req.timezone.as_deref(),
        req.enabled,
    )?;
    Ok(Json(entry))
}

pub async fn trigger_schedule(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<ProactiveDelivery>> {
    Ok(Json(state.scheduler().fire_now(&query.owner_id, &id).await?))
}

pub async fn delete_schedule(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<StatusCode> {
    state.scheduler().delete_schedule(&query.owner_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_summaries(
    State(state): State<UnifiedAppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Summary>>> {
    Ok(Json(state.sessions().list_summaries(&query.owner_id)?))
}

pub async fn get_memory(
    State(state): State<UnifiedAppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Option<OwnerMemory>>> {
    Ok(Json(state.sessions().owner_memory(&query.owner_id)?))
}
