//! HTTP routes: health, contacts and call history

use crate::error::ApiError;
use crate::state::{AppState, AuthUser};
use crate::ws::ws_handler;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use callwire_core::durable::{CallHistoryEntry, CallHistoryStore, ContactDirectory};
use callwire_core::types::UserId;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/contacts", get(list_contacts).post(add_contact))
        .route("/contacts/:contact_id", delete(remove_contact))
        .route("/calls/history", get(call_history))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
    }))
}

async fn list_contacts(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<UserId>>, ApiError> {
    Ok(Json(state.directory.friend_ids(&user).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddContact {
    contact_id: UserId,
}

async fn add_contact(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(body): Json<AddContact>,
) -> Result<StatusCode, ApiError> {
    if body.contact_id.is_blank() || body.contact_id == user {
        return Err(ApiError::BadRequest("Invalid contact id.".into()));
    }

    let created = state.orchestrator.presence().add_friend(&user, &body.contact_id).await?;
    Ok(if created { StatusCode::CREATED } else { StatusCode::OK })
}

async fn remove_contact(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed =
        state.orchestrator.presence().remove_friend(&user, &UserId::new(contact_id)).await?;
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn call_history(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CallHistoryEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(state.history_limit).min(state.history_limit);
    let stored = state.history.history_for(&user, limit).await?;

    Ok(Json(stored.into_iter().map(|call| CallHistoryEntry::for_viewer(call, &user)).collect()))
}
