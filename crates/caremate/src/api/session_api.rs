//! Session and chat endpoints. Every call carries the owner id and the
//! session manager re-checks ownership.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::error::ApiResult;
use crate::context_engine::ChatExchange;
use crate::memory_db::{Session, SessionExport, StoredMessage};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub owner_id: String,
    pub text: String,
}

pub async fn create_session(
    State(state): State<UnifiedAppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.sessions().create_session(&req.owner_id)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<UnifiedAppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions().list_sessions(&query.owner_id)?))
}

pub async fn delete_session(
    State(state): State<UnifiedAppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<StatusCode> {
    state.sessions().delete_session(&query.owner_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_history(
    State(state): State<UnifiedAppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    Ok(Json(state.sessions().get_history(&query.owner_id, &session_id)?))
}

pub async fn send_message(
    State(state): State<UnifiedAppState>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<ChatExchange>> {
    info!("Message for session {} ({} chars)", session_id, req.text.chars().count());
    let exchange = state
        .sessions()
        .send_message(&req.owner_id, &session_id, &req.text)
        .await?;
    Ok(Json(exchange))
}

pub async fn export_session(
    State(state): State<UnifiedAppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<SessionExport>> {
    Ok(Json(state.sessions().export_session(&query.owner_id, &session_id)?))
}

pub async fn archive_session(
    State(state): State<UnifiedAppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions().archive_session(&query.owner_id, &session_id).await?))
}
