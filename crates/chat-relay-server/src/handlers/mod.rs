pub mod admin;
pub mod chat;
mod client_addr;
pub mod health;
pub mod ws;

pub use client_addr::ClientAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Visitor-facing routes
    let chat_routes = Router::new()
        .route("/api/start_chat", post(chat::start_chat_handler))
        .route("/query", post(chat::query_handler))
        .route("/history", get(chat::history_handler))
        .route("/ws", get(ws::ws_handler));

    // Admin reads (secret gate inside the handlers)
    let admin_routes = Router::new()
        .route("/api/chats", get(admin::chats_handler))
        .route("/all_chats", get(admin::all_chats_handler));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(chat_routes)
        .merge(admin_routes)
        .with_state(state)
        // Widget is embedded on third-party pages
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
