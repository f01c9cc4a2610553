//! Message append, sync and participant handlers.

use super::CallerId;
use crate::error::ApiError;
use crate::server::ChatServer;
use crate::storage::AppendOutcome;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use seq_types::{ChatId, NewMessage, SeqNum, SyncPage, UserId};
use serde::Deserialize;
use std::sync::Arc;

/// Query string of the sync endpoint.
#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    /// Return messages strictly after this `seq_num`.
    #[serde(default)]
    pub after_seq: u64,
    /// Page size; clamped to the configured maximum.
    pub limit: Option<u32>,
}

fn parse_chat(raw: &str) -> Result<ChatId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid chat id: {raw}")))
}

/// `POST /chats/{chat_id}/messages`
pub async fn append_handler(
    Extension(server): Extension<Arc<ChatServer>>,
    CallerId(caller): CallerId,
    Path(chat_id): Path<String>,
    Json(message): Json<NewMessage>,
) -> Result<Response, ApiError> {
    let chat_id = parse_chat(&chat_id)?;
    let response = match server.append(&caller, &chat_id, message).await? {
        AppendOutcome::Committed(msg) => (StatusCode::CREATED, Json(msg)).into_response(),
        AppendOutcome::Existing(msg) => (StatusCode::OK, Json(msg)).into_response(),
    };
    Ok(response)
}

/// `GET /chats/{chat_id}/messages/sync?after_seq=&limit=`
pub async fn sync_handler(
    Extension(server): Extension<Arc<ChatServer>>,
    CallerId(caller): CallerId,
    Path(chat_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncPage>, ApiError> {
    let chat_id = parse_chat(&chat_id)?;
    let page = server
        .sync(&caller, &chat_id, SeqNum::new(query.after_seq), query.limit)
        .await?;
    Ok(Json(page))
}

/// `PUT /chats/{chat_id}/participants/{user_id}`
///
/// Stand-in for the external participant service.
pub async fn add_participant_handler(
    Extension(server): Extension<Arc<ChatServer>>,
    Path((chat_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let chat_id = parse_chat(&chat_id)?;
    let user_id: UserId = user_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid user id: {user_id}")))?;

    if server.add_participant(&chat_id, &user_id).await? {
        Ok(StatusCode::CREATED)
    } else {
        Ok(StatusCode::OK)
    }
}
