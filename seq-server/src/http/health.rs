//! `GET /health`: liveness plus a database round trip.
//!
//! Answers 200 while the store responds and 503 otherwise, so a load
//! balancer stops routing appends to an instance that cannot commit them.

use crate::server::ChatServer;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static STARTED: OnceLock<Instant> = OnceLock::new();

/// Record the process start. Later calls are no-ops.
pub fn init_start_time() {
    STARTED.get_or_init(Instant::now);
}

fn uptime_seconds() -> u64 {
    STARTED.get().map_or(0, |t| t.elapsed().as_secs())
}

/// Body of the health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// Store reachability: `ok` or the error text.
    pub storage: String,
    /// Crate version.
    pub version: &'static str,
    /// Open broker WebSocket sessions.
    pub sessions: usize,
    /// Broker channels holding history or subscribers.
    pub channels: usize,
    /// Seconds since [`init_start_time`].
    pub uptime_seconds: u64,
}

impl HealthStatus {
    fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// Health check handler.
pub async fn health_handler(
    Extension(server): Extension<Arc<ChatServer>>,
) -> (StatusCode, Json<HealthStatus>) {
    let (status, storage) = match server.store().ping().await {
        Ok(()) => ("ok", "ok".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "health check: store unreachable");
            ("degraded", e.to_string())
        }
    };

    let body = HealthStatus {
        status,
        storage,
        version: env!("CARGO_PKG_VERSION"),
        sessions: server.total_sessions(),
        channels: server.broker().channel_count(),
        uptime_seconds: uptime_seconds(),
    };
    let code = if body.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: &'static str, storage: &str) -> HealthStatus {
        HealthStatus {
            status,
            storage: storage.to_string(),
            version: "0.1.0",
            sessions: 3,
            channels: 12,
            uptime_seconds: 60,
        }
    }

    #[test]
    fn degraded_store_is_reported() {
        let degraded = status("degraded", "database error: pool timed out");
        assert!(!degraded.is_healthy());

        let json = serde_json::to_value(&degraded).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["storage"], "database error: pool timed out");
        assert_eq!(json["channels"], 12);
    }

    #[test]
    fn reachable_store_is_healthy() {
        assert!(status("ok", "ok").is_healthy());
    }
}
