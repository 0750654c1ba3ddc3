//! HTTP request handlers

use super::types::{
    ConversationResponse, ErrorResponse, ModelsResponse, SendMessageRequest, SendMessageResponse,
    SuccessResponse, ToolsResponse,
};
use super::AppState;
use crate::db::MessageRole;
use crate::runtime::{MessageStore, Outcome, StateStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/messages", post(send_message))
        .route("/api/conversations/:id/reset", post(reset_conversation))
        .route("/api/conversations/:id/tools", get(list_tools))
        .route("/api/models", get(list_models))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Conversation Turns
// ============================================================

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("Message text is empty".to_string()));
    }

    state
        .storage
        .append_message(&id, MessageRole::User, &req.text)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let outcome = state.manager.process_message(&id, &req.text).await;

    let role = match outcome {
        Outcome::Error(_) => MessageRole::System,
        Outcome::Clarification(_) | Outcome::FinalAnswer(_) | Outcome::Cancelled(_) => {
            MessageRole::Assistant
        }
    };
    let message = state
        .storage
        .append_message(&id, role, outcome.text())
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(SendMessageResponse { outcome, message }))
}

async fn reset_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .manager
        .reset_conversation(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Conversation Retrieval
// ============================================================

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conv_state = state
        .storage
        .load(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let messages = state
        .storage
        .list_messages(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ConversationResponse {
        conversation_id: id,
        state: conv_state,
        messages,
    }))
}

async fn list_tools(State(state): State<AppState>, Path(id): Path<String>) -> Json<ToolsResponse> {
    let catalog = state.manager.catalog_for(&id).await;
    Json(ToolsResponse {
        tools: catalog.descriptors(),
    })
}

// ============================================================
// Model Info
// ============================================================

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.llm_registry.available_models(),
        default: state.llm_registry.default_model_id().to_string(),
    })
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("conductor ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
