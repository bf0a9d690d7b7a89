// src/api/router.rs
// HTTP router composition for the council service

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{delete, get, patch, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::{
    handlers::{
        call_mcp_tool, create_conversation, get_conversation, get_mcp_status, get_memory_status,
        get_metrics, get_metrics_ranking, health_handler, list_conversations,
        list_deleted_conversations, permanently_delete_conversation, restore_conversation,
        send_message, soft_delete_conversation, trigger_title_generation,
    },
    stream::stream_message_tokens,
    ws::title_updates_handler,
};

/// Full application router with CORS for the local dev frontends.
pub fn api_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://localhost:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        // Health
        .route("/", get(health_handler))

        // Conversations
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/deleted", get(list_deleted_conversations))
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/message", post(send_message))
        .route(
            "/api/conversations/{id}/message/stream-tokens",
            post(stream_message_tokens),
        )
        .route(
            "/api/conversations/{id}/generate-title",
            post(trigger_title_generation),
        )
        .route("/api/conversations/{id}/delete", patch(soft_delete_conversation))
        .route("/api/conversations/{id}/restore", patch(restore_conversation))
        .route(
            "/api/conversations/{id}/permanent",
            delete(permanently_delete_conversation),
        )

        // Read-only status surfaces
        .route("/api/metrics", get(get_metrics))
        .route("/api/metrics/ranking", get(get_metrics_ranking))
        .route("/api/mcp/status", get(get_mcp_status))
        .route("/api/mcp/call", post(call_mcp_tool))
        .route("/api/memory/status", get(get_memory_status))

        // Legacy title-updates channel (ping/pong only)
        .route("/ws/title-updates", get(title_updates_handler))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
