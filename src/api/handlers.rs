// src/api/handlers.rs
// REST handlers: conversation lifecycle, non-streaming messages, status

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::api::error::{ApiResult, IntoApiError, IntoApiErrorOption};
use crate::router::{SendMessageRequest, run_query_blocking};
use crate::state::AppState;

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok", "service": "Conclave Council API"}))
}

pub async fn create_conversation(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result: ApiResult<_> = state
        .storage
        .create_conversation()
        .into_api_error("Failed to create conversation")
        .map(Json);

    match result {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}

pub async fn list_conversations(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active: Vec<_> = state
        .storage
        .list()
        .into_iter()
        .filter(|meta| !meta.deleted)
        .collect();
    Json(json!(active))
}

pub async fn list_deleted_conversations(State(state): State<Arc<AppState>>) -> Json<Value> {
    let deleted: Vec<_> = state
        .storage
        .list()
        .into_iter()
        .filter(|meta| meta.deleted)
        .collect();
    Json(json!(deleted))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result: ApiResult<_> = state
        .storage
        .get(&id)
        .ok_or_not_found("Conversation not found")
        .map(Json);

    match result {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}

/// Non-streaming message endpoint: runs the full routing pipeline and
/// returns the complete result document.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> impl IntoResponse {
    if state.storage.get(&id).is_none() {
        return crate::api::error::ApiError::not_found("Conversation not found").into_response();
    }

    info!(conversation = id, "non-streaming message");
    let response = run_query_blocking(state, id, request).await;
    Json(response).into_response()
}

pub async fn soft_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result: ApiResult<_> = state
        .storage
        .soft_delete(&id)
        .into_api_error("Failed to delete conversation")
        .map(|_| Json(json!({"success": true, "message": "Conversation moved to recycle bin"})));

    match result {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}

pub async fn restore_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result: ApiResult<_> = state
        .storage
        .restore(&id)
        .into_api_error("Failed to restore conversation")
        .map(|_| Json(json!({"success": true, "message": "Conversation restored"})));

    match result {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}

pub async fn permanently_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.storage.delete_permanent(&id) {
        Json(json!({"success": true, "message": "Conversation permanently deleted"}))
            .into_response()
    } else {
        crate::api::error::ApiError::not_found("Conversation not found").into_response()
    }
}

pub async fn trigger_title_generation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(conversation) = state.storage.get(&id) else {
        return crate::api::error::ApiError::not_found("Conversation not found").into_response();
    };

    let first_message = conversation.messages.iter().find_map(|m| match m {
        crate::storage::Message::User { content } => Some(content.clone()),
        _ => None,
    });

    let Some(first_message) = first_message else {
        return Json(json!({
            "success": false,
            "message": "No user messages found for title generation"
        }))
        .into_response();
    };

    let title = state.titles.generate_title(&first_message).await;
    match state.storage.update_title(&id, &title) {
        Ok(()) => Json(json!({
            "success": true,
            "message": format!("Title updated to: {title}"),
            "title": title,
        }))
        .into_response(),
        Err(e) => crate::api::error::ApiError::internal(e.to_string()).into_response(),
    }
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.all_metrics())
}

pub async fn get_metrics_ranking(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.model_ranking())
}

pub async fn get_mcp_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.registry.status())
}

#[derive(Deserialize)]
pub struct McpCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Direct tool invocation, mainly for debugging configured servers.
pub async fn call_mcp_tool(
    State(state): State<Arc<AppState>>,
    Json(request): Json<McpCallRequest>,
) -> Json<Value> {
    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments
    };
    let outcome = state.registry.call_tool(&request.tool_name, arguments).await;
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

pub async fn get_memory_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.memory.status())
}
