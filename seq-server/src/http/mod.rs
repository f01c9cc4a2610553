//! HTTP endpoints for chatseq-server.
//!
//! Message append and sync, the participant hook, the broker WebSocket
//! gateway, and the health and metrics endpoints.

pub mod health;
mod messages;
mod metrics;
mod ws;

use crate::error::ApiError;
use crate::server::ChatServer;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use seq_types::UserId;
use std::sync::Arc;

pub use health::HealthStatus;

/// Header carrying the caller identity, set by the external auth layer.
pub const CALLER_HEADER: &str = "x-user-id";

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<ChatServer>) -> Router {
    Router::new()
        .route("/chats/:chat_id/messages", post(messages::append_handler))
        .route("/chats/:chat_id/messages/sync", get(messages::sync_handler))
        .route(
            "/chats/:chat_id/participants/:user_id",
            put(messages::add_participant_handler),
        )
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(server))
}

/// Authenticated caller, taken from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct CallerId(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(CallerId)
            .ok_or(ApiError::Unauthenticated)
    }
}
