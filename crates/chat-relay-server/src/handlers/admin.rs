use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{ConversationId, Turn, VisitorInfo};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct AdminParams {
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatsResponse {
    pub active: HashMap<ConversationId, VisitorInfo>,
    pub history: HashMap<ConversationId, Vec<Turn>>,
}

#[derive(Debug, Serialize)]
pub struct AllChatsResponse {
    pub chats: HashMap<ConversationId, Vec<Turn>>,
}

fn authorize(state: &AppState, params: &AdminParams) -> Result<(), ApiError> {
    if state.is_admin(params.secret.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Unauthorized".to_string()))
    }
}

/// Live visitor registrations plus every stored history.
pub async fn chats_handler(
    State(state): State<AppState>,
    Query(params): Query<AdminParams>,
) -> Result<Json<ChatsResponse>, ApiError> {
    authorize(&state, &params)?;
    Ok(Json(ChatsResponse {
        active: state.registry().active_chats(),
        history: state.window().all_conversations().await,
    }))
}

pub async fn all_chats_handler(
    State(state): State<AppState>,
    Query(params): Query<AdminParams>,
) -> Result<Json<AllChatsResponse>, ApiError> {
    authorize(&state, &params)?;
    Ok(Json(AllChatsResponse {
        chats: state.window().all_conversations().await,
    }))
}
