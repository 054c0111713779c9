use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::client_addr::ClientAddr;
use crate::models::{ParticipantRole, Turn, VisitorInfo};
use crate::services::{AiReply, ChatRelay};
use crate::utils::error::ApiError;

// ===== REQUEST / RESPONSE MODELS =====

#[derive(Debug, Default, Deserialize)]
pub struct StartChatRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartChatResponse {
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub chat_id: String,
    pub history: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub chat_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<Turn>,
}

// ===== HANDLERS =====

pub async fn start_chat_handler(
    State(relay): State<Arc<ChatRelay>>,
    Json(request): Json<StartChatRequest>,
) -> Json<StartChatResponse> {
    let visitor = VisitorInfo::new(request.name, request.email);
    let chat_id = relay.start_chat(visitor).await;
    Json(StartChatResponse { chat_id })
}

/// Request/response variant of a visitor message: waits for the AI reply.
pub async fn query_handler(
    State(relay): State<Arc<ChatRelay>>,
    ClientAddr(origin): ClientAddr,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("No query provided".to_string()));
    }

    let chat_id = request
        .chat_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| origin.clone())
        .ok_or_else(|| ApiError::BadRequest("chat_id required".to_string()))?;

    info!(
        conversation_id = %chat_id,
        query_len = request.query.len(),
        "Query request"
    );

    let receipt = relay
        .post(&chat_id, ParticipantRole::Visitor, &request.query, origin)
        .await?;

    let response = match receipt.reply {
        AiReply::Answered(turn) => turn.content,
        AiReply::Failed { fallback_message } => {
            return Err(ApiError::UpstreamError(fallback_message));
        }
        AiReply::NotTriggered => {
            return Err(ApiError::Unavailable(
                "AI replies are disabled on this server".to_string(),
            ));
        }
    };

    let history = relay.window().history(&chat_id).await;
    Ok(Json(QueryResponse {
        response,
        chat_id,
        history,
    }))
}

pub async fn history_handler(
    State(relay): State<Arc<ChatRelay>>,
    Query(params): Query<HistoryParams>,
) -> Json<HistoryResponse> {
    let history = match params.chat_id.filter(|id| !id.trim().is_empty()) {
        Some(chat_id) => relay.window().history(&chat_id).await,
        None => Vec::new(),
    };
    Json(HistoryResponse { history })
}
